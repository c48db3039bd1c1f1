//! API models for time tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::time_entries::TimeEntryDBResponse,
    types::{TicketId, TimeEntryId, UserId},
};

fn default_billable() -> bool {
    true
}

/// Start a timer on a ticket. Only one timer runs per user.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimerStart {
    #[serde(default = "default_billable")]
    pub billable: bool,
    pub note: Option<String>,
}

/// Log finished work. Give either `ended_at` or `duration_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimeEntryCreate {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    #[serde(default = "default_billable")]
    pub billable: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimeEntryResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TimeEntryId,
    #[schema(value_type = String, format = "uuid")]
    pub ticket_id: TicketId,
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub user_email: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whole minutes, rounded up; absent while the timer runs
    pub duration_minutes: Option<i32>,
    pub billable: bool,
    pub note: Option<String>,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
}

impl From<TimeEntryDBResponse> for TimeEntryResponse {
    fn from(db: TimeEntryDBResponse) -> Self {
        Self {
            is_running: db.is_running(),
            id: db.id,
            ticket_id: db.ticket_id,
            user_id: db.user_id,
            user_email: db.user_email,
            started_at: db.started_at,
            ended_at: db.ended_at,
            duration_minutes: db.duration_minutes,
            billable: db.billable,
            note: db.note,
            created_at: db.created_at,
        }
    }
}
