//! Database models for email ingestion runs and per-message logs.

use crate::types::{CommentId, IngestRunId, TicketId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    CreatedTicket,
    AppendedComment,
    Duplicate,
    Rejected,
    Failed,
}

impl IngestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestOutcome::CreatedTicket => "created_ticket",
            IngestOutcome::AppendedComment => "appended_comment",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Rejected => "rejected",
            IngestOutcome::Failed => "failed",
        }
    }

    /// Outcomes after which the message counts as handled and leaves the inbox.
    pub fn is_processed(self) -> bool {
        !matches!(self, IngestOutcome::Failed)
    }
}

impl fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for IngestOutcome {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "created_ticket" => Ok(IngestOutcome::CreatedTicket),
            "appended_comment" => Ok(IngestOutcome::AppendedComment),
            "duplicate" => Ok(IngestOutcome::Duplicate),
            "rejected" => Ok(IngestOutcome::Rejected),
            "failed" => Ok(IngestOutcome::Failed),
            other => Err(format!("unknown ingest outcome '{other}'")),
        }
    }
}

/// Per-run tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunCounters {
    pub fetched: i32,
    pub created_tickets: i32,
    pub appended_comments: i32,
    pub duplicates: i32,
    pub rejected: i32,
    pub failed: i32,
}

impl RunCounters {
    pub fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::CreatedTicket => self.created_tickets += 1,
            IngestOutcome::AppendedComment => self.appended_comments += 1,
            IngestOutcome::Duplicate => self.duplicates += 1,
            IngestOutcome::Rejected => self.rejected += 1,
            IngestOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct IngestRunDBResponse {
    pub id: IngestRunId,
    pub mailbox: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i32,
    pub created_tickets: i32,
    pub appended_comments: i32,
    pub duplicates: i32,
    pub rejected: i32,
    pub failed: i32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestLogCreateDBRequest {
    pub run_id: Option<IngestRunId>,
    pub mailbox: String,
    pub uid: Option<i64>,
    pub message_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub outcome: IngestOutcome,
    pub ticket_id: Option<TicketId>,
    pub comment_id: Option<CommentId>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct IngestLogDBResponse {
    pub id: uuid::Uuid,
    pub run_id: Option<IngestRunId>,
    pub mailbox: String,
    pub uid: Option<i64>,
    pub message_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    #[sqlx(try_from = "String")]
    pub outcome: IngestOutcome,
    pub ticket_id: Option<TicketId>,
    pub comment_id: Option<CommentId>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record() {
        let mut counters = RunCounters::default();
        counters.record(IngestOutcome::CreatedTicket);
        counters.record(IngestOutcome::CreatedTicket);
        counters.record(IngestOutcome::Failed);
        assert_eq!(counters.created_tickets, 2);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.duplicates, 0);
    }

    #[test]
    fn test_outcome_strings() {
        for outcome in [
            IngestOutcome::CreatedTicket,
            IngestOutcome::AppendedComment,
            IngestOutcome::Duplicate,
            IngestOutcome::Rejected,
            IngestOutcome::Failed,
        ] {
            assert_eq!(IngestOutcome::try_from(outcome.to_string()), Ok(outcome));
        }
        assert!(!IngestOutcome::Failed.is_processed());
        assert!(IngestOutcome::Rejected.is_processed());
    }
}
