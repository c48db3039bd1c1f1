//! Database models for recurring tasks and their schedule arithmetic.

use crate::types::{LookupId, OrganizationId, RecurringTaskId, TicketId, UserId};
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Recurrence {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            other => Err(format!("unknown recurrence '{other}'")),
        }
    }
}

/// The `k`-th occurrence of a schedule starting at `anchor` (the anchor itself is `k = 0`).
///
/// Monthly schedules count months from the anchor, so a task anchored on the 31st runs on the
/// last day of shorter months and returns to the 31st afterwards.
pub fn occurrence(recurrence: Recurrence, interval: u32, anchor: DateTime<Utc>, k: u32) -> Option<DateTime<Utc>> {
    let steps = i64::from(interval) * i64::from(k);
    match recurrence {
        Recurrence::Daily => anchor.checked_add_signed(Duration::try_days(steps)?),
        Recurrence::Weekly => anchor.checked_add_signed(Duration::try_weeks(steps)?),
        Recurrence::Monthly => anchor.checked_add_months(Months::new(interval.checked_mul(k)?)),
    }
}

/// First occurrence strictly after `after`. Missed occurrences are skipped, not replayed.
pub fn next_occurrence(recurrence: Recurrence, interval: u32, anchor: DateTime<Utc>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let interval = interval.max(1);
    if anchor > after {
        return Some(anchor);
    }

    let elapsed_units = match recurrence {
        Recurrence::Daily => (after - anchor).num_days(),
        Recurrence::Weekly => (after - anchor).num_weeks(),
        Recurrence::Monthly => {
            i64::from(after.year() - anchor.year()) * 12 + i64::from(after.month()) - i64::from(anchor.month())
        }
    };
    let estimate = u32::try_from(elapsed_units / i64::from(interval)).ok()?;

    // The estimate can be one step early or late around month ends; walk forward from just below it
    let mut k = estimate.saturating_sub(1);
    loop {
        let candidate = occurrence(recurrence, interval, anchor, k)?;
        if candidate > after {
            return Some(candidate);
        }
        k = k.checked_add(1)?;
    }
}

#[derive(Debug, Clone)]
pub struct RecurringTaskCreateDBRequest {
    pub subject: String,
    pub description: String,
    pub requester_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub assignee_id: Option<UserId>,
    pub priority_id: Option<LookupId>,
    pub ticket_type_id: Option<LookupId>,
    pub recurrence: Recurrence,
    pub interval_count: i32,
    pub starts_at: DateTime<Utc>,
    pub created_by: Option<UserId>,
}

/// `None` leaves a column unchanged. A new schedule (`recurrence`, `interval_count` or
/// `starts_at`) recomputes `next_run_at`.
#[derive(Debug, Clone, Default)]
pub struct RecurringTaskUpdateDBRequest {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub assignee_id: Option<UserId>,
    pub clear_assignee: bool,
    pub priority_id: Option<LookupId>,
    pub ticket_type_id: Option<LookupId>,
    pub recurrence: Option<Recurrence>,
    pub interval_count: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct RecurringTaskDBResponse {
    pub id: RecurringTaskId,
    pub subject: String,
    pub description: String,
    pub requester_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub assignee_id: Option<UserId>,
    pub priority_id: Option<LookupId>,
    pub ticket_type_id: Option<LookupId>,
    #[sqlx(try_from = "String")]
    pub recurrence: Recurrence,
    pub interval_count: i32,
    pub starts_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_ticket_id: Option<TicketId>,
    pub is_active: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTaskDBResponse {
    pub fn interval(&self) -> u32 {
        u32::try_from(self.interval_count).unwrap_or(1).max(1)
    }
}
