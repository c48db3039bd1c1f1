//! Report filters, result rows and saved report templates.

use crate::types::{OrganizationId, ReportTemplateId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrouping {
    #[default]
    Organization,
    Agent,
    Ticket,
    Day,
}

/// Filters for the time report. The range is `[from, to)` on entry start times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, IntoParams)]
pub struct TimeReportFilters {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub group_by: TimeGrouping,
    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub agent_id: Option<UserId>,
    #[serde(default)]
    pub billable_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct TimeReportRow {
    /// Id of the group (organization, agent or ticket id, or `YYYY-MM-DD`)
    pub key: String,
    pub label: String,
    pub total_minutes: i64,
    pub billable_minutes: i64,
    pub entry_count: i64,
    /// Billable hours multiplied by the organization's hourly rate
    pub billable_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimeReport {
    pub filters: TimeReportFilters,
    pub rows: Vec<TimeReportRow>,
    pub total_minutes: i64,
    pub billable_minutes: i64,
    pub billable_amount: Decimal,
}

/// Filters for the ticket report. The range applies to creation and close times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, IntoParams)]
pub struct TicketReportFilters {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[param(value_type = Option<String>, format = "uuid")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub organization_id: Option<OrganizationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct CountRow {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TicketReport {
    pub filters: TicketReportFilters,
    pub created: i64,
    pub closed: i64,
    /// Currently open tickets by status, regardless of the range
    pub open_by_status: Vec<CountRow>,
    /// Tickets created in the range by priority
    pub created_by_priority: Vec<CountRow>,
    /// Tickets created in the range by type
    pub created_by_type: Vec<CountRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Time,
    Tickets,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Time => "time",
            ReportKind::Tickets => "tickets",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ReportKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "time" => Ok(ReportKind::Time),
            "tickets" => Ok(ReportKind::Tickets),
            other => Err(format!("unknown report kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportTemplateCreateDBRequest {
    pub name: String,
    pub owner_id: UserId,
    pub kind: ReportKind,
    pub filters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ReportTemplateUpdateDBRequest {
    pub name: Option<String>,
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReportTemplateDBResponse {
    pub id: ReportTemplateId,
    pub name: String,
    pub owner_id: UserId,
    #[sqlx(try_from = "String")]
    pub kind: ReportKind,
    pub filters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
