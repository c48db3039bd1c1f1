use crate::{
    AppState,
    api::models::{
        pagination::PaginatedResponse,
        tickets::{ListTicketsQuery, TicketAssign, TicketCreate, TicketResponse, TicketUpdate},
        users::CurrentUser,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{
            Lookups, Repository, Settings, TicketDefaults, Tickets, Users,
            tickets::{TicketFilter, TicketScope},
        },
        models::{
            lookups::LookupKind,
            tickets::{TicketCreateDBRequest, TicketDBResponse, TicketSource, TicketUpdateDBRequest},
        },
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, TicketId, UserId, abbrev_uuid},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;
use tracing::{info, warn};

fn ticket_not_found(id: TicketId) -> Error {
    Error::NotFound {
        resource: "Ticket".to_string(),
        id: id.to_string(),
    }
}

fn staff_only(action: Operation, what: &str) -> Error {
    Error::InsufficientPermissions {
        required: Permission::Allow(Resource::Tickets, Operation::UpdateAll),
        action,
        resource: what.to_string(),
    }
}

/// Load a ticket the caller is allowed to see.
///
/// Staff see every ticket. Clients see tickets they requested, plus tickets of their
/// organization when `clients_see_organization_tickets` is on. Anything else is reported
/// as not found.
pub(crate) async fn visible_ticket(conn: &mut PgConnection, user: &CurrentUser, id: TicketId) -> Result<TicketDBResponse> {
    let ticket = Tickets::new(&mut *conn).get_by_id(id).await?.ok_or_else(|| ticket_not_found(id))?;

    if user.is_staff() || ticket.requester_id == user.id {
        return Ok(ticket);
    }

    if let Some(organization_id) = user.organization_id
        && ticket.organization_id == Some(organization_id)
        && Settings::new(&mut *conn).load().await?.clients_see_organization_tickets
    {
        return Ok(ticket);
    }

    Err(ticket_not_found(id))
}

/// Assignees must be active staff.
pub(crate) async fn ensure_assignable(conn: &mut PgConnection, assignee_id: UserId) -> Result<()> {
    match Users::new(conn).get_by_id(assignee_id).await? {
        Some(user) if user.is_active && user.role.is_staff() => Ok(()),
        Some(_) => Err(Error::BadRequest {
            message: "Tickets can only be assigned to active agents or admins".to_string(),
        }),
        None => Err(Error::BadRequest {
            message: format!("User {assignee_id} does not exist"),
        }),
    }
}

#[utoipa::path(
    get,
    path = "/tickets",
    tag = "tickets",
    summary = "List tickets",
    description = "Staff see all tickets. Clients see their own tickets, and their organization's when that setting is on.",
    responses(
        (status = 200, description = "Paginated list of tickets, most recent activity first", body = PaginatedResponse<TicketResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    params(ListTicketsQuery),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<ListTicketsQuery>,
    current_user: RequiresPermission<resource::Tickets, operation::ReadOwn>,
) -> Result<Json<PaginatedResponse<TicketResponse>>> {
    let user = current_user.user;
    let (skip, limit) = query.pagination.params();

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let scope = if user.is_staff() {
        None
    } else {
        let settings = Settings::new(&mut tx).load().await?;
        Some(TicketScope {
            requester_id: user.id,
            organization_id: user.organization_id.filter(|_| settings.clients_see_organization_tickets),
        })
    };

    let filter = TicketFilter {
        status_id: query.status_id,
        priority_id: query.priority_id,
        ticket_type_id: query.ticket_type_id,
        assignee_id: query.assignee_id,
        unassigned: query.unassigned.unwrap_or(false),
        requester_id: query.requester_id,
        organization_id: query.organization_id,
        open_only: query.open_only.unwrap_or(false),
        search: query.search,
        scope,
        ..TicketFilter::new(skip, limit)
    };

    let mut repo = Tickets::new(&mut tx);
    let tickets = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(PaginatedResponse::new(
        tickets.into_iter().map(TicketResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

/// Open a ticket
///
/// Clients open tickets for themselves and may choose priority and type. Staff may also
/// pick the requester, organization, assignee and status. Omitted lookups use the defaults.
#[utoipa::path(
    post,
    path = "/tickets",
    tag = "tickets",
    summary = "Create ticket",
    request_body = TicketCreate,
    responses(
        (status = 201, description = "Ticket created", body = TicketResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Clients sent staff-only fields"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_ticket(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Tickets, operation::CreateOwn>,
    Json(create): Json<TicketCreate>,
) -> Result<(StatusCode, Json<TicketResponse>)> {
    let user = current_user.user;

    let subject = create.subject.trim().to_string();
    if subject.is_empty() {
        return Err(Error::BadRequest {
            message: "A ticket needs a subject".to_string(),
        });
    }

    if !user.is_staff() {
        let sets_staff_fields = create.requester_id.is_some_and(|id| id != user.id)
            || create.organization_id.is_some()
            || create.assignee_id.is_some()
            || create.status_id.is_some();
        if sets_staff_fields {
            return Err(staff_only(Operation::CreateAll, "ticket requester, organization, assignee or status"));
        }
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;

    let requester = match create.requester_id {
        Some(requester_id) if requester_id != user.id => Users::new(&mut tx)
            .get_by_id(requester_id)
            .await?
            .ok_or_else(|| Error::BadRequest {
                message: format!("Requester {requester_id} does not exist"),
            })?,
        _ => Users::new(&mut tx)
            .get_by_id(user.id)
            .await?
            .ok_or_else(|| Error::Unauthenticated { message: None })?,
    };

    if let Some(assignee_id) = create.assignee_id {
        ensure_assignable(&mut tx, assignee_id).await?;
    }

    let defaults = TicketDefaults::load(&mut tx).await?;
    let ticket = Tickets::new(&mut tx)
        .create(&TicketCreateDBRequest {
            subject,
            description: create.description,
            requester_id: requester.id,
            organization_id: create.organization_id.or(requester.organization_id),
            assignee_id: create.assignee_id,
            status_id: create.status_id.unwrap_or(defaults.status_id),
            priority_id: create.priority_id.unwrap_or(defaults.priority_id),
            ticket_type_id: create.ticket_type_id.unwrap_or(defaults.ticket_type_id),
            source: TicketSource::Web,
            message_id: None,
            due_at: create.due_at,
        })
        .await?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    info!(ticket_id = %abbrev_uuid(&ticket.id), reference = ticket.reference, "Ticket created");
    state.notifier.ticket_created(ticket.id);
    if ticket.assignee_id.is_some() {
        state.notifier.ticket_assigned(ticket.id);
    }

    Ok((StatusCode::CREATED, Json(TicketResponse::from(ticket))))
}

#[utoipa::path(
    get,
    path = "/tickets/{ticket_id}",
    tag = "tickets",
    summary = "Get ticket",
    responses(
        (status = 200, description = "Ticket details", body = TicketResponse),
        (status = 404, description = "Ticket not found or not visible to the caller"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Tickets, operation::ReadOwn>,
) -> Result<Json<TicketResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let ticket = visible_ticket(&mut conn, &current_user.user, ticket_id).await?;
    Ok(Json(TicketResponse::from(ticket)))
}

/// Update a ticket
///
/// Staff may change any field. Clients may only move their own ticket into a closed
/// status, and only when `clients_can_close_tickets` is on.
#[utoipa::path(
    patch,
    path = "/tickets/{ticket_id}",
    tag = "tickets",
    summary = "Update ticket",
    request_body = TicketUpdate,
    responses(
        (status = 200, description = "Ticket updated", body = TicketResponse),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Tickets, operation::UpdateOwn>,
    Json(update): Json<TicketUpdate>,
) -> Result<Json<TicketResponse>> {
    let user = current_user.user;
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let before = visible_ticket(&mut tx, &user, ticket_id).await?;

    if !user.is_staff() {
        let Some(status_id) = update.status_id.filter(|_| update.is_status_only()) else {
            return Err(staff_only(Operation::UpdateAll, "ticket fields other than the status"));
        };
        let may_close = before.requester_id == user.id
            && Settings::new(&mut tx).load().await?.clients_can_close_tickets
            && Lookups::new(&mut tx, LookupKind::Statuses).is_closed_status(status_id).await?;
        if !may_close {
            return Err(staff_only(Operation::UpdateAll, "ticket status"));
        }
    }

    if let Some(subject) = &update.subject
        && subject.trim().is_empty()
    {
        return Err(Error::BadRequest {
            message: "A ticket needs a subject".to_string(),
        });
    }

    if let Some(assignee_id) = update.assignee_id {
        ensure_assignable(&mut tx, assignee_id).await?;
    }

    let ticket = Tickets::new(&mut tx)
        .update(
            ticket_id,
            &TicketUpdateDBRequest {
                subject: update.subject,
                description: update.description,
                organization_id: update.organization_id,
                assignee_id: update.assignee_id,
                clear_assignee: update.clear_assignee,
                status_id: update.status_id,
                priority_id: update.priority_id,
                ticket_type_id: update.ticket_type_id,
                due_at: update.due_at,
                clear_due_at: update.clear_due_at,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => ticket_not_found(ticket_id),
            other => other.into(),
        })?;

    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    if ticket.assignee_id.is_some() && ticket.assignee_id != before.assignee_id {
        state.notifier.ticket_assigned(ticket.id);
    }

    Ok(Json(TicketResponse::from(ticket)))
}

#[utoipa::path(
    post,
    path = "/tickets/{ticket_id}/assign",
    tag = "tickets",
    summary = "Assign ticket",
    request_body = TicketAssign,
    responses(
        (status = 200, description = "Ticket assigned, or unassigned with a null assignee", body = TicketResponse),
        (status = 400, description = "Assignee is not active staff"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn assign_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    _: RequiresPermission<resource::Tickets, operation::UpdateAll>,
    Json(assign): Json<TicketAssign>,
) -> Result<Json<TicketResponse>> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let before = Tickets::new(&mut tx)
        .get_by_id(ticket_id)
        .await?
        .ok_or_else(|| ticket_not_found(ticket_id))?;

    if let Some(assignee_id) = assign.assignee_id {
        ensure_assignable(&mut tx, assignee_id).await?;
    }

    let ticket = Tickets::new(&mut tx)
        .update(
            ticket_id,
            &TicketUpdateDBRequest {
                assignee_id: assign.assignee_id,
                clear_assignee: assign.assignee_id.is_none(),
                ..Default::default()
            },
        )
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    if ticket.assignee_id.is_some() && ticket.assignee_id != before.assignee_id {
        state.notifier.ticket_assigned(ticket.id);
    }

    Ok(Json(TicketResponse::from(ticket)))
}

/// Delete a ticket
///
/// Removes comments, time entries and attachments along with the ticket, including the
/// attachment files on disk.
#[utoipa::path(
    delete,
    path = "/tickets/{ticket_id}",
    tag = "tickets",
    summary = "Delete ticket",
    responses(
        (status = 204, description = "Ticket deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    _: RequiresPermission<resource::Tickets, operation::DeleteAll>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if !Tickets::new(&mut conn).delete(ticket_id).await? {
        return Err(ticket_not_found(ticket_id));
    }

    if let Err(e) = state.storage.delete_ticket_dir(ticket_id).await {
        warn!(ticket_id = %abbrev_uuid(&ticket_id), error = %e, "Failed to remove attachment directory of deleted ticket");
    }

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::settings::SystemSettings,
        test_utils::{
            bearer_token, create_test_app, create_test_organization, create_test_ticket, create_test_user, create_test_user_in_org,
        },
    };
    use serde_json::json;
    use sqlx::PgPool;

    async fn status_id(pool: &PgPool, name: &str) -> uuid::Uuid {
        sqlx::query_scalar("SELECT id FROM statuses WHERE name = $1")
            .bind(name)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn update_settings(pool: &PgPool, change: impl FnOnce(&mut SystemSettings)) {
        let mut conn = pool.acquire().await.unwrap();
        let mut settings = Settings::new(&mut conn).load().await.unwrap();
        change(&mut settings);
        Settings::new(&mut conn).save(&settings).await.unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_client_creates_ticket_with_defaults(pool: PgPool) {
        let organization = create_test_organization(&pool).await;
        let client = create_test_user_in_org(&pool, Role::User, Some(organization.id)).await;
        let server = create_test_app(pool);

        let response = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"subject": "  VPN is down  ", "description": "Since this morning"}))
            .await;
        response.assert_status(StatusCode::CREATED);

        let ticket: TicketResponse = response.json();
        assert_eq!(ticket.subject, "VPN is down");
        assert_eq!(ticket.requester_id, client.id);
        assert_eq!(ticket.organization_id, Some(organization.id));
        assert_eq!(ticket.status_name, "Open");
        assert_eq!(ticket.source, TicketSource::Web);
        assert!(ticket.assignee_id.is_none());
        assert!(!ticket.is_closed);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_client_cannot_set_staff_fields(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let server = create_test_app(pool);

        let response = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"subject": "Help", "assignee_id": agent.id}))
            .await;
        response.assert_status_forbidden();

        let response = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"subject": "   "}))
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_agent_opens_ticket_on_behalf_of_client(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let ticket: TicketResponse = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"subject": "Phoned in", "requester_id": client.id, "assignee_id": agent.id}))
            .await
            .json();
        assert_eq!(ticket.requester_id, client.id);
        assert_eq!(ticket.assignee_id, Some(agent.id));

        let response = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"subject": "Bad assignee", "assignee_id": client.id}))
            .await;
        response.assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_visibility_by_role_and_setting(pool: PgPool) {
        let organization = create_test_organization(&pool).await;
        let requester = create_test_user_in_org(&pool, Role::User, Some(organization.id)).await;
        let colleague = create_test_user_in_org(&pool, Role::User, Some(organization.id)).await;
        let stranger = create_test_user(&pool, Role::User).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let server = create_test_app(pool.clone());

        let ticket: TicketResponse = server
            .post("/api/v1/tickets")
            .authorization_bearer(bearer_token(&requester))
            .json(&json!({"subject": "Shared printer"}))
            .await
            .json();
        let path = format!("/api/v1/tickets/{}", ticket.id);

        server.get(&path).authorization_bearer(bearer_token(&requester)).await.assert_status_ok();
        server.get(&path).authorization_bearer(bearer_token(&agent)).await.assert_status_ok();
        server.get(&path).authorization_bearer(bearer_token(&stranger)).await.assert_status_not_found();
        server.get(&path).authorization_bearer(bearer_token(&colleague)).await.assert_status_not_found();

        let page: PaginatedResponse<TicketResponse> = server
            .get("/api/v1/tickets")
            .authorization_bearer(bearer_token(&colleague))
            .await
            .json();
        assert_eq!(page.total_count, 0);

        update_settings(&pool, |s| s.clients_see_organization_tickets = true).await;

        server.get(&path).authorization_bearer(bearer_token(&colleague)).await.assert_status_ok();
        let page: PaginatedResponse<TicketResponse> = server
            .get("/api/v1/tickets")
            .authorization_bearer(bearer_token(&colleague))
            .await
            .json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, ticket.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_filters(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let first = create_test_ticket(&pool).await;
        let second = create_test_ticket(&pool).await;
        let closed = status_id(&pool, "Closed").await;
        let server = create_test_app(pool);

        server
            .patch(&format!("/api/v1/tickets/{}", second.id))
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"status_id": closed}))
            .await
            .assert_status_ok();

        let page: PaginatedResponse<TicketResponse> = server
            .get("/api/v1/tickets?open_only=true")
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, first.id);

        let page: PaginatedResponse<TicketResponse> = server
            .get(&format!("/api/v1/tickets?search=%23{}", second.reference))
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.data[0].id, second.id);

        let page: PaginatedResponse<TicketResponse> = server
            .get("/api/v1/tickets?unassigned=true&limit=1")
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.data.len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_closing_sets_and_reopening_clears_closed_at(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let closed = status_id(&pool, "Closed").await;
        let open = status_id(&pool, "Open").await;
        let server = create_test_app(pool);
        let path = format!("/api/v1/tickets/{}", ticket.id);

        let updated: TicketResponse = server
            .patch(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"status_id": closed}))
            .await
            .json();
        assert!(updated.is_closed);
        assert!(updated.closed_at.is_some());

        let updated: TicketResponse = server
            .patch(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"status_id": open}))
            .await
            .json();
        assert!(!updated.is_closed);
        assert!(updated.closed_at.is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_client_close_depends_on_setting(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;
        let closed = status_id(&pool, "Closed").await;
        let in_progress = status_id(&pool, "In Progress").await;
        let mut conn = pool.acquire().await.unwrap();
        let requester = Users::new(&mut conn).get_by_id(ticket.requester_id).await.unwrap().unwrap();
        drop(conn);
        let server = create_test_app(pool.clone());
        let path = format!("/api/v1/tickets/{}", ticket.id);

        update_settings(&pool, |s| s.clients_can_close_tickets = false).await;
        server
            .patch(&path)
            .authorization_bearer(bearer_token(&requester))
            .json(&json!({"status_id": closed}))
            .await
            .assert_status_forbidden();

        update_settings(&pool, |s| s.clients_can_close_tickets = true).await;
        server
            .patch(&path)
            .authorization_bearer(bearer_token(&requester))
            .json(&json!({"status_id": in_progress}))
            .await
            .assert_status_forbidden();
        server
            .patch(&path)
            .authorization_bearer(bearer_token(&requester))
            .json(&json!({"status_id": closed, "subject": "Renamed"}))
            .await
            .assert_status_forbidden();

        let updated: TicketResponse = server
            .patch(&path)
            .authorization_bearer(bearer_token(&requester))
            .json(&json!({"status_id": closed}))
            .await
            .json();
        assert!(updated.is_closed);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_assign_and_unassign(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let client = create_test_user(&pool, Role::User).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);
        let path = format!("/api/v1/tickets/{}/assign", ticket.id);

        let assigned: TicketResponse = server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"assignee_id": agent.id}))
            .await
            .json();
        assert_eq!(assigned.assignee_id, Some(agent.id));
        assert_eq!(assigned.assignee_email.as_deref(), Some(agent.email.as_str()));

        let unassigned: TicketResponse = server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"assignee_id": null}))
            .await
            .json();
        assert!(unassigned.assignee_id.is_none());

        server
            .post(&path)
            .authorization_bearer(bearer_token(&client))
            .json(&json!({"assignee_id": agent.id}))
            .await
            .assert_status_forbidden();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_is_admin_only(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);
        let path = format!("/api/v1/tickets/{}", ticket.id);

        server.delete(&path).authorization_bearer(bearer_token(&agent)).await.assert_status_forbidden();
        server
            .delete(&path)
            .authorization_bearer(bearer_token(&admin))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server.get(&path).authorization_bearer(bearer_token(&admin)).await.assert_status_not_found();
    }
}
