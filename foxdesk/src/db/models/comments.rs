//! Database models for ticket comments.

use crate::db::models::tickets::TicketSource;
use crate::types::{CommentId, TicketId, UserId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone)]
pub struct CommentCreateDBRequest {
    pub ticket_id: TicketId,
    /// `None` for email senders that are not (yet) users
    pub author_id: Option<UserId>,
    pub author_email: String,
    pub body: String,
    pub is_internal: bool,
    pub source: TicketSource,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CommentDBResponse {
    pub id: CommentId,
    pub ticket_id: TicketId,
    pub author_id: Option<UserId>,
    pub author_email: String,
    pub body: String,
    pub is_internal: bool,
    #[sqlx(try_from = "String")]
    pub source: TicketSource,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
