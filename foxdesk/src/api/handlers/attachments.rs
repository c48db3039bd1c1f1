use crate::{
    AppState,
    api::{handlers::tickets::visible_ticket, models::attachments::AttachmentResponse},
    auth::permissions::{RequiresPermission, has_permission, operation, resource},
    db::{
        handlers::{Attachments, Comments},
        models::attachments::AttachmentCreateDBRequest,
    },
    errors::{Error, Result},
    storage::sanitize_filename,
    types::{AttachmentId, CommentId, Operation, Resource, TicketId, abbrev_uuid},
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Files accepted in a single upload request.
pub const MAX_FILES_PER_UPLOAD: usize = 10;

struct UploadedFile {
    filename: String,
    content_type: String,
    content: Vec<u8>,
}

fn attachment_not_found(id: AttachmentId) -> Error {
    Error::NotFound {
        resource: "Attachment".to_string(),
        id: id.to_string(),
    }
}

fn content_type_for(filename: &str, declared: Option<&str>) -> String {
    match mime_guess::from_path(filename).first_raw() {
        Some(guessed) => guessed.to_string(),
        None => declared
            .filter(|d| !d.trim().is_empty())
            .unwrap_or("application/octet-stream")
            .to_string(),
    }
}

/// `Content-Disposition` for a download. Non-ASCII characters become `_` so the value
/// is always a valid header.
fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .filter(|c| !matches!(c, '"' | '\\'))
        .collect();
    format!("attachment; filename=\"{ascii}\"")
}

#[utoipa::path(
    get,
    path = "/tickets/{ticket_id}/attachments",
    tag = "attachments",
    summary = "List attachments",
    description = "Attachments of internal notes are only listed for staff.",
    responses(
        (status = 200, description = "Attachments on the ticket", body = Vec<AttachmentResponse>),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_attachments(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Attachments, operation::ReadOwn>,
) -> Result<Json<Vec<AttachmentResponse>>> {
    let user = current_user.user;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    visible_ticket(&mut conn, &user, ticket_id).await?;

    let include_internal = has_permission(&user, Resource::InternalComments, Operation::ReadAll);
    let attachments = Attachments::new(&mut conn).list_for_ticket(ticket_id, include_internal).await?;

    Ok(Json(attachments.into_iter().map(AttachmentResponse::from).collect()))
}

/// Upload attachments
///
/// Multipart form with one or more `file` parts and an optional `comment_id` part that
/// attaches the files to a comment on the same ticket. Every file is checked against the
/// size limit and extension denylist before anything is stored.
#[utoipa::path(
    post,
    path = "/tickets/{ticket_id}/attachments",
    tag = "attachments",
    summary = "Upload attachments",
    request_body(content_type = "multipart/form-data", description = "`file` parts and an optional `comment_id`"),
    responses(
        (status = 201, description = "Attachments stored", body = Vec<AttachmentResponse>),
        (status = 400, description = "No files, too many files, or a file was rejected"),
        (status = 404, description = "Ticket or comment not found"),
        (status = 413, description = "Payload too large"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn upload_attachments(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::Attachments, operation::CreateOwn>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<AttachmentResponse>>)> {
    let user = current_user.user;
    let max_size = state.config.attachments.max_size_bytes;

    let mut files: Vec<UploadedFile> = Vec::new();
    let mut comment_id: Option<CommentId> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| Error::BadRequest {
        message: format!("Failed to parse multipart data: {e}"),
    })? {
        match field.name().unwrap_or("") {
            "file" => {
                if files.len() == MAX_FILES_PER_UPLOAD {
                    return Err(Error::BadRequest {
                        message: format!("At most {MAX_FILES_PER_UPLOAD} files can be uploaded at once"),
                    });
                }

                let filename = sanitize_filename(field.file_name().unwrap_or("attachment"));
                let content_type = content_type_for(&filename, field.content_type());

                let mut content = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(|e| Error::BadRequest {
                    message: format!("Failed to read file chunk: {e}"),
                })? {
                    content.extend_from_slice(&chunk);
                    // Stop reading as soon as the limit is crossed
                    if content.len() as u64 > max_size {
                        break;
                    }
                }

                state
                    .storage
                    .check(&filename, content.len() as u64)
                    .map_err(|rejection| Error::BadRequest {
                        message: format!("{filename}: {rejection}"),
                    })?;

                files.push(UploadedFile {
                    filename,
                    content_type,
                    content,
                });
            }
            "comment_id" => {
                let value = field.text().await.map_err(|e| Error::BadRequest {
                    message: format!("Failed to read comment_id: {e}"),
                })?;
                comment_id = Some(Uuid::parse_str(value.trim()).map_err(|_| Error::BadRequest {
                    message: format!("'{value}' is not a valid comment id"),
                })?);
            }
            other => {
                warn!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    if files.is_empty() {
        return Err(Error::BadRequest {
            message: "No file was uploaded".to_string(),
        });
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    visible_ticket(&mut tx, &user, ticket_id).await?;

    if let Some(comment_id) = comment_id {
        let comment = Comments::new(&mut tx).get_by_id(comment_id).await?;
        let usable = comment.is_some_and(|c| c.ticket_id == ticket_id && (!c.is_internal || user.is_staff()));
        if !usable {
            return Err(Error::NotFound {
                resource: "Comment".to_string(),
                id: comment_id.to_string(),
            });
        }
    }

    let mut stored_paths = Vec::with_capacity(files.len());
    let mut created = Vec::with_capacity(files.len());
    let result: Result<()> = async {
        for file in &files {
            let attachment_id = Uuid::new_v4();
            let stored = state.storage.store(ticket_id, attachment_id, &file.content).await?;
            stored_paths.push(stored.storage_path.clone());

            let attachment = Attachments::new(&mut tx)
                .create(&AttachmentCreateDBRequest {
                    id: attachment_id,
                    ticket_id,
                    comment_id,
                    uploaded_by: Some(user.id),
                    filename: file.filename.clone(),
                    content_type: file.content_type.clone(),
                    size_bytes: stored.size_bytes,
                    sha256: stored.sha256,
                    storage_path: stored.storage_path,
                })
                .await?;
            created.push(attachment);
        }
        Ok(())
    }
    .await;

    let result = match result {
        Ok(()) => tx.commit().await.map_err(|e| Error::Database(e.into())),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        for path in &stored_paths {
            if let Err(cleanup) = state.storage.delete(path).await {
                warn!(path = %path, error = %cleanup, "Failed to remove attachment after aborted upload");
            }
        }
        return Err(e);
    }

    info!(ticket_id = %abbrev_uuid(&ticket_id), count = created.len(), "Attachments uploaded");
    Ok((StatusCode::CREATED, Json(created.into_iter().map(AttachmentResponse::from).collect())))
}

#[utoipa::path(
    get,
    path = "/attachments/{attachment_id}/content",
    tag = "attachments",
    summary = "Download attachment",
    responses(
        (status = 200, description = "File content", content_type = "application/octet-stream"),
        (status = 404, description = "Attachment not found"),
    ),
    params(("attachment_id" = uuid::Uuid, Path, description = "Attachment ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn download_attachment(
    State(state): State<AppState>,
    Path(attachment_id): Path<AttachmentId>,
    current_user: RequiresPermission<resource::Attachments, operation::ReadOwn>,
) -> Result<Response> {
    let user = current_user.user;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;

    let mut repo = Attachments::new(&mut conn);
    let attachment = repo.get_by_id(attachment_id).await?.ok_or_else(|| attachment_not_found(attachment_id))?;
    if !user.is_staff() && repo.is_internal(attachment_id).await? {
        return Err(attachment_not_found(attachment_id));
    }
    visible_ticket(&mut conn, &user, attachment.ticket_id)
        .await
        .map_err(|_| attachment_not_found(attachment_id))?;
    drop(conn);

    let content = state.storage.retrieve(&attachment.storage_path).await.map_err(|e| {
        warn!(attachment_id = %abbrev_uuid(&attachment_id), error = %e, "Attachment file is missing or unreadable");
        attachment_not_found(attachment_id)
    })?;

    let content_type = HeaderValue::from_str(&attachment.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&content_disposition(&attachment.filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        ],
        content,
    )
        .into_response())
}

#[utoipa::path(
    delete,
    path = "/attachments/{attachment_id}",
    tag = "attachments",
    summary = "Delete attachment",
    responses(
        (status = 204, description = "Attachment deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Attachment not found"),
    ),
    params(("attachment_id" = uuid::Uuid, Path, description = "Attachment ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_attachment(
    State(state): State<AppState>,
    Path(attachment_id): Path<AttachmentId>,
    _: RequiresPermission<resource::Attachments, operation::DeleteAll>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let deleted = Attachments::new(&mut conn)
        .delete(attachment_id)
        .await?
        .ok_or_else(|| attachment_not_found(attachment_id))?;

    if let Err(e) = state.storage.delete(&deleted.storage_path).await {
        warn!(attachment_id = %abbrev_uuid(&attachment_id), error = %e, "Failed to remove attachment file");
    }

    Ok(StatusCode::NO_CONTENT)
}
