//! Database models for time entries.

use crate::types::{TicketId, TimeEntryId, UserId};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Manually logged work, or a timer start when `ended_at` and `duration_minutes` are absent.
#[derive(Debug, Clone)]
pub struct TimeEntryCreateDBRequest {
    pub ticket_id: TicketId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub billable: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TimeEntryDBResponse {
    pub id: TimeEntryId,
    pub ticket_id: TicketId,
    pub user_id: UserId,
    pub user_email: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub billable: bool,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TimeEntryDBResponse {
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Whole minutes between two instants, rounded up, never less than one.
pub fn billable_minutes(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i32 {
    let seconds = (ended_at - started_at).num_seconds().max(0);
    let minutes = (seconds + 59) / 60;
    minutes.clamp(1, i32::MAX as i64) as i32
}
