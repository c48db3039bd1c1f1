//! Database models for ticket lookups (priorities, statuses and ticket types).

use crate::types::LookupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Which lookup table a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Priorities,
    Statuses,
    TicketTypes,
}

impl LookupKind {
    pub fn table(self) -> &'static str {
        match self {
            LookupKind::Priorities => "priorities",
            LookupKind::Statuses => "statuses",
            LookupKind::TicketTypes => "ticket_types",
        }
    }

    /// Column on `tickets` (and `recurring_tasks`, where present) that references this lookup.
    pub fn ticket_column(self) -> &'static str {
        match self {
            LookupKind::Priorities => "priority_id",
            LookupKind::Statuses => "status_id",
            LookupKind::TicketTypes => "ticket_type_id",
        }
    }

    /// Statuses are not referenced by recurring tasks.
    pub fn used_by_recurring_tasks(self) -> bool {
        !matches!(self, LookupKind::Statuses)
    }

    pub fn entity_name(self) -> &'static str {
        match self {
            LookupKind::Priorities => "priority",
            LookupKind::Statuses => "status",
            LookupKind::TicketTypes => "ticket type",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupCreateDBRequest {
    pub name: String,
    pub color: Option<String>,
    pub sort_order: i32,
    pub is_default: bool,
    /// Only stored for statuses
    pub is_closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LookupUpdateDBRequest {
    pub name: Option<String>,
    pub color: Option<String>,
    pub sort_order: Option<i32>,
    pub is_default: Option<bool>,
    pub is_closed: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LookupDBResponse {
    pub id: LookupId,
    pub name: String,
    pub color: String,
    pub sort_order: i32,
    pub is_default: bool,
    pub is_closed: bool,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
