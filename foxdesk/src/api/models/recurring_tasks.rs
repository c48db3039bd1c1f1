//! API models for recurring tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

use super::pagination::Pagination;
use crate::{
    db::models::recurring_tasks::{Recurrence, RecurringTaskDBResponse},
    types::{LookupId, OrganizationId, RecurringTaskId, TicketId, UserId},
};

fn default_interval() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecurringTaskCreate {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[schema(value_type = String, format = "uuid")]
    pub requester_id: UserId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    pub recurrence: Recurrence,
    /// Every `interval_count` days, weeks or months
    #[serde(default = "default_interval")]
    pub interval_count: i32,
    /// First occurrence; later ones keep its time of day (and day of month)
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RecurringTaskUpdate {
    pub subject: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    #[serde(default)]
    pub clear_assignee: bool,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    pub recurrence: Option<Recurrence>,
    pub interval_count: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecurringTaskResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: RecurringTaskId,
    pub subject: String,
    pub description: String,
    #[schema(value_type = String, format = "uuid")]
    pub requester_id: UserId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assignee_id: Option<UserId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub priority_id: Option<LookupId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub ticket_type_id: Option<LookupId>,
    pub recurrence: Recurrence,
    pub interval_count: i32,
    pub starts_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub last_ticket_id: Option<TicketId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RecurringTaskDBResponse> for RecurringTaskResponse {
    fn from(db: RecurringTaskDBResponse) -> Self {
        Self {
            id: db.id,
            subject: db.subject,
            description: db.description,
            requester_id: db.requester_id,
            organization_id: db.organization_id,
            assignee_id: db.assignee_id,
            priority_id: db.priority_id,
            ticket_type_id: db.ticket_type_id,
            recurrence: db.recurrence,
            interval_count: db.interval_count,
            starts_at: db.starts_at,
            next_run_at: db.next_run_at,
            last_run_at: db.last_run_at,
            last_ticket_id: db.last_ticket_id,
            is_active: db.is_active,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListRecurringTasksQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub active_only: Option<bool>,
}
