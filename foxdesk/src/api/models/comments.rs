//! API models for ticket comments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::{comments::CommentDBResponse, tickets::TicketSource},
    types::{CommentId, TicketId, UserId},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentCreate {
    pub body: String,
    /// Staff-only note, never shown to or mailed to clients
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: CommentId,
    #[schema(value_type = String, format = "uuid")]
    pub ticket_id: TicketId,
    /// Absent for email senders without an account
    #[schema(value_type = Option<String>, format = "uuid")]
    pub author_id: Option<UserId>,
    pub author_email: String,
    pub body: String,
    pub is_internal: bool,
    pub source: TicketSource,
    pub created_at: DateTime<Utc>,
}

impl From<CommentDBResponse> for CommentResponse {
    fn from(db: CommentDBResponse) -> Self {
        Self {
            id: db.id,
            ticket_id: db.ticket_id,
            author_id: db.author_id,
            author_email: db.author_email,
            body: db.body,
            is_internal: db.is_internal,
            source: db.source,
            created_at: db.created_at,
        }
    }
}
