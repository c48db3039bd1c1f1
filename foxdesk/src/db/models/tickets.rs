//! Database models for tickets.

use crate::types::{LookupId, OrganizationId, TicketId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

/// Channel a ticket or comment arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TicketSource {
    Web,
    Email,
    Api,
    Recurring,
}

impl TicketSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketSource::Web => "web",
            TicketSource::Email => "email",
            TicketSource::Api => "api",
            TicketSource::Recurring => "recurring",
        }
    }
}

impl fmt::Display for TicketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TicketSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "web" => Ok(TicketSource::Web),
            "email" => Ok(TicketSource::Email),
            "api" => Ok(TicketSource::Api),
            "recurring" => Ok(TicketSource::Recurring),
            other => Err(format!("unknown ticket source '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TicketCreateDBRequest {
    pub subject: String,
    pub description: String,
    pub requester_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub assignee_id: Option<UserId>,
    pub status_id: LookupId,
    pub priority_id: LookupId,
    pub ticket_type_id: LookupId,
    pub source: TicketSource,
    /// Message-ID of the email that opened the ticket
    pub message_id: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

/// `None` leaves a column unchanged; the `clear_*` flags null a column out.
#[derive(Debug, Clone, Default)]
pub struct TicketUpdateDBRequest {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub organization_id: Option<OrganizationId>,
    pub assignee_id: Option<UserId>,
    pub clear_assignee: bool,
    pub status_id: Option<LookupId>,
    pub priority_id: Option<LookupId>,
    pub ticket_type_id: Option<LookupId>,
    pub due_at: Option<DateTime<Utc>>,
    pub clear_due_at: bool,
}

/// Ticket row joined with its lookup names and people.
#[derive(Debug, Clone, FromRow)]
pub struct TicketDBResponse {
    pub id: TicketId,
    pub reference: i64,
    pub subject: String,
    pub description: String,
    pub requester_id: UserId,
    pub requester_email: String,
    pub organization_id: Option<OrganizationId>,
    pub assignee_id: Option<UserId>,
    pub assignee_email: Option<String>,
    pub status_id: LookupId,
    pub status_name: String,
    pub is_closed: bool,
    pub priority_id: LookupId,
    pub priority_name: String,
    pub ticket_type_id: LookupId,
    pub ticket_type_name: String,
    #[sqlx(try_from = "String")]
    pub source: TicketSource,
    pub message_id: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
