//! Database models for ticket attachments.

use crate::types::{AttachmentId, CommentId, TicketId, UserId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone)]
pub struct AttachmentCreateDBRequest {
    /// Chosen up front so the file can be written before the row exists
    pub id: AttachmentId,
    pub ticket_id: TicketId,
    pub comment_id: Option<CommentId>,
    pub uploaded_by: Option<UserId>,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub storage_path: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct AttachmentDBResponse {
    pub id: AttachmentId,
    pub ticket_id: TicketId,
    pub comment_id: Option<CommentId>,
    pub uploaded_by: Option<UserId>,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
}
