//! Database repository for attachment metadata. File contents live in [`crate::storage`].

use crate::{
    db::{
        errors::Result,
        models::attachments::{AttachmentCreateDBRequest, AttachmentDBResponse},
    },
    types::{AttachmentId, TicketId, abbrev_uuid},
};
use sqlx::PgConnection;
use tracing::instrument;

const ATTACHMENT_COLUMNS: &str =
    "id, ticket_id, comment_id, uploaded_by, filename, content_type, size_bytes, sha256, storage_path, created_at";

pub struct Attachments<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Attachments<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(ticket_id = %abbrev_uuid(&request.ticket_id), filename = %request.filename), err)]
    pub async fn create(&mut self, request: &AttachmentCreateDBRequest) -> Result<AttachmentDBResponse> {
        let attachment = sqlx::query_as::<_, AttachmentDBResponse>(&format!(
            r#"
            INSERT INTO ticket_attachments (id, ticket_id, comment_id, uploaded_by, filename, content_type, size_bytes, sha256, storage_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {ATTACHMENT_COLUMNS}
            "#
        ))
        .bind(request.id)
        .bind(request.ticket_id)
        .bind(request.comment_id)
        .bind(request.uploaded_by)
        .bind(&request.filename)
        .bind(&request.content_type)
        .bind(request.size_bytes)
        .bind(&request.sha256)
        .bind(&request.storage_path)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(attachment)
    }

    #[instrument(skip(self), fields(attachment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: AttachmentId) -> Result<Option<AttachmentDBResponse>> {
        let attachment =
            sqlx::query_as::<_, AttachmentDBResponse>(&format!("SELECT {ATTACHMENT_COLUMNS} FROM ticket_attachments WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(attachment)
    }

    /// Attachments on a ticket. Files on internal comments are left out unless asked for.
    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&ticket_id)), err)]
    pub async fn list_for_ticket(&mut self, ticket_id: TicketId, include_internal: bool) -> Result<Vec<AttachmentDBResponse>> {
        let attachments = sqlx::query_as::<_, AttachmentDBResponse>(
            r#"
            SELECT a.id, a.ticket_id, a.comment_id, a.uploaded_by, a.filename, a.content_type,
                   a.size_bytes, a.sha256, a.storage_path, a.created_at
            FROM ticket_attachments a
            LEFT JOIN ticket_comments c ON c.id = a.comment_id
            WHERE a.ticket_id = $1 AND ($2 OR NOT COALESCE(c.is_internal, FALSE))
            ORDER BY a.created_at, a.id
            "#,
        )
        .bind(ticket_id)
        .bind(include_internal)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(attachments)
    }

    /// Whether an attachment hangs off an internal comment.
    #[instrument(skip(self), fields(attachment_id = %abbrev_uuid(&id)), err)]
    pub async fn is_internal(&mut self, id: AttachmentId) -> Result<bool> {
        let internal: Option<bool> = sqlx::query_scalar(
            "SELECT c.is_internal FROM ticket_attachments a JOIN ticket_comments c ON c.id = a.comment_id WHERE a.id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(internal.unwrap_or(false))
    }

    #[instrument(skip(self), fields(attachment_id = %abbrev_uuid(&id)), err)]
    pub async fn delete(&mut self, id: AttachmentId) -> Result<Option<AttachmentDBResponse>> {
        let deleted =
            sqlx::query_as::<_, AttachmentDBResponse>(&format!("DELETE FROM ticket_attachments WHERE id = $1 RETURNING {ATTACHMENT_COLUMNS}"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(deleted)
    }
}
