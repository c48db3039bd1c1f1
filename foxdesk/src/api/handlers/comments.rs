use crate::{
    AppState,
    api::{
        handlers::tickets::visible_ticket,
        models::comments::{CommentCreate, CommentResponse},
    },
    auth::permissions::{RequiresPermission, has_permission, operation, resource},
    db::{
        handlers::{Comments, Lookups, Tickets},
        models::{comments::CommentCreateDBRequest, lookups::LookupKind, tickets::TicketSource},
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, TicketId, abbrev_uuid},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

#[utoipa::path(
    get,
    path = "/tickets/{ticket_id}/comments",
    tag = "comments",
    summary = "List comments",
    description = "Oldest first. Internal notes are only included for staff.",
    responses(
        (status = 200, description = "Comments on the ticket", body = Vec<CommentResponse>),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_comments(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Comments, operation::ReadOwn>,
) -> Result<Json<Vec<CommentResponse>>> {
    let user = current_user.user;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    visible_ticket(&mut conn, &user, ticket_id).await?;

    let include_internal = has_permission(&user, Resource::InternalComments, Operation::ReadAll);
    let comments = Comments::new(&mut conn).list_for_ticket(ticket_id, include_internal).await?;

    Ok(Json(comments.into_iter().map(CommentResponse::from).collect()))
}

/// Add a comment
///
/// Internal notes are staff only. A client reply on a closed ticket reopens it.
#[utoipa::path(
    post,
    path = "/tickets/{ticket_id}/comments",
    tag = "comments",
    summary = "Add comment",
    request_body = CommentCreate,
    responses(
        (status = 201, description = "Comment added", body = CommentResponse),
        (status = 400, description = "Empty comment"),
        (status = 403, description = "Clients cannot add internal notes"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_comment(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Comments, operation::CreateOwn>,
    Json(create): Json<CommentCreate>,
) -> Result<(StatusCode, Json<CommentResponse>)> {
    let user = current_user.user;

    let body = create.body.trim().to_string();
    if body.is_empty() {
        return Err(Error::BadRequest {
            message: "Comment body must not be empty".to_string(),
        });
    }
    if create.is_internal && !has_permission(&user, Resource::InternalComments, Operation::CreateAll) {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::InternalComments, Operation::CreateAll),
            action: Operation::CreateAll,
            resource: "internal note".to_string(),
        });
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let ticket = visible_ticket(&mut tx, &user, ticket_id).await?;

    let comment = Comments::new(&mut tx)
        .create(&CommentCreateDBRequest {
            ticket_id,
            author_id: Some(user.id),
            author_email: user.email.clone(),
            body,
            is_internal: create.is_internal,
            source: TicketSource::Web,
            message_id: None,
        })
        .await?;

    if ticket.is_closed && !user.is_staff() {
        let open_status_id = Lookups::new(&mut tx, LookupKind::Statuses).default_open_status_id().await?;
        if Tickets::new(&mut tx).reopen(ticket_id, open_status_id).await? {
            info!(ticket_id = %abbrev_uuid(&ticket_id), "Ticket reopened by client reply");
        }
    }

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    state.notifier.comment_added(ticket_id, comment.id);

    Ok((StatusCode::CREATED, Json(CommentResponse::from(comment))))
}
