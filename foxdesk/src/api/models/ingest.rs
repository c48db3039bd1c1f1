//! API models for email ingestion runs and logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::pagination::Pagination;
use crate::{
    db::models::ingest::{IngestLogDBResponse, IngestOutcome, IngestRunDBResponse},
    types::{CommentId, IngestRunId, TicketId},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IngestRunResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: IngestRunId,
    pub mailbox: String,
    /// `scheduled` or `manual`
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i32,
    pub created_tickets: i32,
    pub appended_comments: i32,
    pub duplicates: i32,
    pub rejected: i32,
    pub failed: i32,
    /// Set when the run ended early, e.g. the IMAP server was unreachable
    pub error: Option<String>,
}

impl From<IngestRunDBResponse> for IngestRunResponse {
    fn from(db: IngestRunDBResponse) -> Self {
        Self {
            id: db.id,
            mailbox: db.mailbox,
            trigger: db.trigger,
            started_at: db.started_at,
            finished_at: db.finished_at,
            fetched: db.fetched,
            created_tickets: db.created_tickets,
            appended_comments: db.appended_comments,
            duplicates: db.duplicates,
            rejected: db.rejected,
            failed: db.failed,
            error: db.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IngestLogResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub run_id: Option<IngestRunId>,
    pub mailbox: String,
    pub uid: Option<i64>,
    pub message_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub outcome: IngestOutcome,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_id: Option<TicketId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub comment_id: Option<CommentId>,
    /// Rejection reason, failure cause or notes such as skipped attachments
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<IngestLogDBResponse> for IngestLogResponse {
    fn from(db: IngestLogDBResponse) -> Self {
        Self {
            id: db.id,
            run_id: db.run_id,
            mailbox: db.mailbox,
            uid: db.uid,
            message_id: db.message_id,
            from_address: db.from_address,
            subject: db.subject,
            outcome: db.outcome,
            ticket_id: db.ticket_id,
            comment_id: db.comment_id,
            detail: db.detail,
            created_at: db.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListIngestLogsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    #[param(value_type = Option<String>, format = "uuid")]
    pub run_id: Option<IngestRunId>,

    pub outcome: Option<IngestOutcome>,
}
