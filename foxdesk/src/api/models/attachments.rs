//! API models for ticket attachments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::attachments::AttachmentDBResponse,
    types::{AttachmentId, CommentId, TicketId, UserId},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttachmentResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: AttachmentId,
    #[schema(value_type = String, format = "uuid")]
    pub ticket_id: TicketId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub comment_id: Option<CommentId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub uploaded_by: Option<UserId>,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// Hex SHA-256 of the content
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl From<AttachmentDBResponse> for AttachmentResponse {
    fn from(db: AttachmentDBResponse) -> Self {
        Self {
            id: db.id,
            ticket_id: db.ticket_id,
            comment_id: db.comment_id,
            uploaded_by: db.uploaded_by,
            filename: db.filename,
            content_type: db.content_type,
            size_bytes: db.size_bytes,
            sha256: db.sha256,
            created_at: db.created_at,
        }
    }
}
