//! API models for saved report templates.
//!
//! Report filters and results are shared with the database layer, see
//! [`crate::db::models::reports`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::reports::{ReportKind, ReportTemplateDBResponse, TicketReport, TicketReportFilters, TimeReport, TimeReportFilters},
    errors::Error,
    types::{ReportTemplateId, UserId},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportTemplateCreate {
    pub name: String,
    pub kind: ReportKind,
    /// `TimeReportFilters` or `TicketReportFilters`, matching `kind`
    #[schema(value_type = Object)]
    pub filters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReportTemplateUpdate {
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportTemplateResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ReportTemplateId,
    pub name: String,
    #[schema(value_type = String, format = "uuid")]
    pub owner_id: UserId,
    pub kind: ReportKind,
    #[schema(value_type = Object)]
    pub filters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ReportTemplateDBResponse> for ReportTemplateResponse {
    fn from(db: ReportTemplateDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            owner_id: db.owner_id,
            kind: db.kind,
            filters: db.filters,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// Typed filters of a template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateFilters {
    Time(TimeReportFilters),
    Tickets(TicketReportFilters),
}

impl TemplateFilters {
    /// Check stored filters against the template kind.
    pub fn parse(kind: ReportKind, filters: &serde_json::Value) -> Result<Self, Error> {
        let invalid = |e: serde_json::Error| Error::BadRequest {
            message: format!("Invalid {kind} report filters: {e}"),
        };
        let parsed = match kind {
            ReportKind::Time => Self::Time(serde_json::from_value(filters.clone()).map_err(invalid)?),
            ReportKind::Tickets => Self::Tickets(serde_json::from_value(filters.clone()).map_err(invalid)?),
        };

        let (from, to) = match &parsed {
            Self::Time(f) => (f.from, f.to),
            Self::Tickets(f) => (f.from, f.to),
        };
        if from >= to {
            return Err(Error::BadRequest {
                message: "Report range must end after it starts".to_string(),
            });
        }
        Ok(parsed)
    }
}

/// Result of running a template; exactly one of `time` and `tickets` is set.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportRunResponse {
    pub template: ReportTemplateResponse,
    pub time: Option<TimeReport>,
    pub tickets: Option<TicketReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_template_filters() {
        let filters = json!({"from": "2025-01-01T00:00:00Z", "to": "2025-02-01T00:00:00Z", "group_by": "agent"});
        let TemplateFilters::Time(parsed) = TemplateFilters::parse(ReportKind::Time, &filters).unwrap() else {
            panic!("expected time filters");
        };
        assert_eq!(parsed.group_by, crate::db::models::reports::TimeGrouping::Agent);
        assert!(!parsed.billable_only);

        assert!(TemplateFilters::parse(ReportKind::Tickets, &json!({"from": "2025-01-01T00:00:00Z"})).is_err());

        let backwards = json!({"from": "2025-02-01T00:00:00Z", "to": "2025-01-01T00:00:00Z"});
        assert!(TemplateFilters::parse(ReportKind::Tickets, &backwards).is_err());
    }
}
