//! API request/response models for tickets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::{
    db::models::tickets::{TicketDBResponse, TicketSource},
    types::{LookupId, OrganizationId, TicketId, UserId},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TicketCreate {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    /// Staff only: open the ticket on behalf of another user (defaults to the caller)
    #[schema(value_type = Option<String>, format = "uuid")]
    pub requester_id: Option<UserId>,
    /// Staff only; defaults to the requester's organization
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    /// Staff only
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    /// Staff only; defaults to the default open status
    #[schema(value_type = Option<String>, format = "uuid")]
    pub status_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    pub due_at: Option<DateTime<Utc>>,
}

/// Partial update. Clients may only send `status_id`, and only to close their own ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TicketUpdate {
    pub subject: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    /// Remove the assignee
    #[serde(default)]
    pub clear_assignee: bool,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub status_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_due_at: bool,
}

impl TicketUpdate {
    /// True when nothing but the status is being changed.
    pub fn is_status_only(&self) -> bool {
        self.subject.is_none()
            && self.description.is_none()
            && self.organization_id.is_none()
            && self.assignee_id.is_none()
            && !self.clear_assignee
            && self.priority_id.is_none()
            && self.ticket_type_id.is_none()
            && self.due_at.is_none()
            && !self.clear_due_at
    }
}

/// Assign a ticket, or unassign it with `null`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TicketAssign {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TicketResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TicketId,
    /// Human reference number shown as `[FD-<reference>]`
    pub reference: i64,
    pub subject: String,
    pub description: String,
    #[schema(value_type = String, format = "uuid")]
    pub requester_id: UserId,
    pub requester_email: String,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    pub assignee_email: Option<String>,
    #[schema(value_type = String, format = "uuid")]
    pub status_id: LookupId,
    pub status_name: String,
    pub is_closed: bool,
    #[schema(value_type = String, format = "uuid")]
    pub priority_id: LookupId,
    pub priority_name: String,
    #[schema(value_type = String, format = "uuid")]
    pub ticket_type_id: LookupId,
    pub ticket_type_name: String,
    pub source: TicketSource,
    pub due_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TicketDBResponse> for TicketResponse {
    fn from(db: TicketDBResponse) -> Self {
        Self {
            id: db.id,
            reference: db.reference,
            subject: db.subject,
            description: db.description,
            requester_id: db.requester_id,
            requester_email: db.requester_email,
            organization_id: db.organization_id,
            assignee_id: db.assignee_id,
            assignee_email: db.assignee_email,
            status_id: db.status_id,
            status_name: db.status_name,
            is_closed: db.is_closed,
            priority_id: db.priority_id,
            priority_name: db.priority_name,
            ticket_type_id: db.ticket_type_id,
            ticket_type_name: db.ticket_type_name,
            source: db.source,
            due_at: db.due_at,
            closed_at: db.closed_at,
            last_activity_at: db.last_activity_at,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListTicketsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    #[param(value_type = Option<String>, format = "uuid")]
    pub status_id: Option<LookupId>,
    #[param(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[param(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    #[param(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    /// Only tickets without an assignee
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub unassigned: Option<bool>,
    #[param(value_type = Option<String>, format = "uuid")]
    pub requester_id: Option<UserId>,
    #[param(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    /// Only tickets in a status that is not closed
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub open_only: Option<bool>,
    /// Matches subject, description, or a `#<reference>` number
    pub search: Option<String>,
}
