//! Report queries and saved report templates.

use crate::{
    db::{
        errors::{DbError, Result},
        models::reports::{
            CountRow, ReportTemplateCreateDBRequest, ReportTemplateDBResponse, ReportTemplateUpdateDBRequest, TicketReport,
            TicketReportFilters, TimeGrouping, TimeReport, TimeReportFilters, TimeReportRow,
        },
    },
    types::{ReportTemplateId, UserId, abbrev_uuid},
};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

/// `(key, label)` expressions for a grouping.
fn grouping_columns(group_by: TimeGrouping) -> (&'static str, &'static str) {
    match group_by {
        TimeGrouping::Organization => ("COALESCE(o.id::text, 'none')", "COALESCE(o.name, 'No organization')"),
        TimeGrouping::Agent => ("u.id::text", "COALESCE(u.display_name, u.email)"),
        TimeGrouping::Ticket => ("t.id::text", "'#' || t.reference || ' ' || t.subject"),
        TimeGrouping::Day => (
            "to_char(e.started_at AT TIME ZONE 'UTC', 'YYYY-MM-DD')",
            "to_char(e.started_at AT TIME ZONE 'UTC', 'YYYY-MM-DD')",
        ),
    }
}

pub struct Reports<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Reports<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Finished time entries in the range, grouped. Running timers are not counted.
    #[instrument(skip(self, filters), fields(group_by = ?filters.group_by), err)]
    pub async fn time_report(&mut self, filters: &TimeReportFilters) -> Result<TimeReport> {
        let (key, label) = grouping_columns(filters.group_by);
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            r#"
            SELECT
                {key} AS key,
                {label} AS label,
                COALESCE(SUM(e.duration_minutes), 0)::BIGINT AS total_minutes,
                COALESCE(SUM(CASE WHEN e.billable THEN e.duration_minutes ELSE 0 END), 0)::BIGINT AS billable_minutes,
                COUNT(*)::BIGINT AS entry_count,
                ROUND(COALESCE(SUM(
                    CASE WHEN e.billable THEN e.duration_minutes * COALESCE(o.billable_rate, 0) / 60 ELSE 0 END
                ), 0), 2)::NUMERIC AS billable_amount
            FROM time_entries e
            JOIN tickets t ON t.id = e.ticket_id
            JOIN users u ON u.id = e.user_id
            LEFT JOIN organizations o ON o.id = t.organization_id
            WHERE e.duration_minutes IS NOT NULL
            "#
        ));
        builder.push(" AND e.started_at >= ");
        builder.push_bind(filters.from);
        builder.push(" AND e.started_at < ");
        builder.push_bind(filters.to);
        if let Some(organization_id) = filters.organization_id {
            builder.push(" AND t.organization_id = ");
            builder.push_bind(organization_id);
        }
        if let Some(agent_id) = filters.agent_id {
            builder.push(" AND e.user_id = ");
            builder.push_bind(agent_id);
        }
        if filters.billable_only {
            builder.push(" AND e.billable");
        }
        builder.push(" GROUP BY 1, 2 ORDER BY 2, 1");

        let rows = builder.build_query_as::<TimeReportRow>().fetch_all(&mut *self.db).await?;

        Ok(TimeReport {
            filters: filters.clone(),
            total_minutes: rows.iter().map(|r| r.total_minutes).sum(),
            billable_minutes: rows.iter().map(|r| r.billable_minutes).sum(),
            billable_amount: rows.iter().map(|r| r.billable_amount).sum::<Decimal>(),
            rows,
        })
    }

    #[instrument(skip(self, filters), err)]
    pub async fn ticket_report(&mut self, filters: &TicketReportFilters) -> Result<TicketReport> {
        let (created, closed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $1 AND created_at < $2),
                COUNT(*) FILTER (WHERE closed_at >= $1 AND closed_at < $2)
            FROM tickets
            WHERE ($3::uuid IS NULL OR organization_id = $3)
            "#,
        )
        .bind(filters.from)
        .bind(filters.to)
        .bind(filters.organization_id)
        .fetch_one(&mut *self.db)
        .await?;

        let open_by_status = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT s.name AS label, COUNT(t.id)::BIGINT AS count
            FROM statuses s
            LEFT JOIN tickets t ON t.status_id = s.id AND ($1::uuid IS NULL OR t.organization_id = $1)
            WHERE NOT s.is_closed
            GROUP BY s.name, s.sort_order
            ORDER BY s.sort_order, s.name
            "#,
        )
        .bind(filters.organization_id)
        .fetch_all(&mut *self.db)
        .await?;

        let created_by_priority = self.created_by_lookup("priorities", "priority_id", filters).await?;
        let created_by_type = self.created_by_lookup("ticket_types", "ticket_type_id", filters).await?;

        Ok(TicketReport {
            filters: filters.clone(),
            created,
            closed,
            open_by_status,
            created_by_priority,
            created_by_type,
        })
    }

    async fn created_by_lookup(&mut self, table: &'static str, column: &'static str, filters: &TicketReportFilters) -> Result<Vec<CountRow>> {
        let rows = sqlx::query_as::<_, CountRow>(&format!(
            r#"
            SELECT l.name AS label, COUNT(t.id)::BIGINT AS count
            FROM {table} l
            LEFT JOIN tickets t ON t.{column} = l.id
                AND t.created_at >= $1 AND t.created_at < $2
                AND ($3::uuid IS NULL OR t.organization_id = $3)
            GROUP BY l.name, l.sort_order
            ORDER BY l.sort_order, l.name
            "#
        ))
        .bind(filters.from)
        .bind(filters.to)
        .bind(filters.organization_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows)
    }
}

const TEMPLATE_COLUMNS: &str = "id, name, owner_id, kind, filters, created_at, updated_at";

pub struct ReportTemplates<'c> {
    db: &'c mut PgConnection,
}

impl<'c> ReportTemplates<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(name = %request.name, kind = %request.kind), err)]
    pub async fn create(&mut self, request: &ReportTemplateCreateDBRequest) -> Result<ReportTemplateDBResponse> {
        let template = sqlx::query_as::<_, ReportTemplateDBResponse>(&format!(
            "INSERT INTO report_templates (name, owner_id, kind, filters) VALUES ($1, $2, $3, $4) RETURNING {TEMPLATE_COLUMNS}"
        ))
        .bind(request.name.trim())
        .bind(request.owner_id)
        .bind(request.kind.as_str())
        .bind(&request.filters)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(template)
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: ReportTemplateId) -> Result<Option<ReportTemplateDBResponse>> {
        let template =
            sqlx::query_as::<_, ReportTemplateDBResponse>(&format!("SELECT {TEMPLATE_COLUMNS} FROM report_templates WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(template)
    }

    /// Templates owned by a user, or every template when `owner_id` is `None`.
    #[instrument(skip(self), err)]
    pub async fn list(&mut self, owner_id: Option<UserId>) -> Result<Vec<ReportTemplateDBResponse>> {
        let templates = sqlx::query_as::<_, ReportTemplateDBResponse>(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM report_templates WHERE ($1::uuid IS NULL OR owner_id = $1) ORDER BY name, id"
        ))
        .bind(owner_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(templates)
    }

    #[instrument(skip(self, request), fields(template_id = %abbrev_uuid(&id)), err)]
    pub async fn update(&mut self, id: ReportTemplateId, request: &ReportTemplateUpdateDBRequest) -> Result<ReportTemplateDBResponse> {
        let template = sqlx::query_as::<_, ReportTemplateDBResponse>(&format!(
            r#"
            UPDATE report_templates SET
                name = COALESCE($2, name),
                filters = COALESCE($3, filters),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TEMPLATE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.name.as_deref().map(str::trim))
        .bind(&request.filters)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(template)
    }

    #[instrument(skip(self), fields(template_id = %abbrev_uuid(&id)), err)]
    pub async fn delete(&mut self, id: ReportTemplateId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM report_templates WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::{
            handlers::{organizations::Organizations, repository::Repository, time_entries::TimeEntries, tickets::Tickets},
            models::{
                organizations::OrganizationCreateDBRequest, reports::ReportKind, tickets::TicketUpdateDBRequest,
                time_entries::TimeEntryCreateDBRequest,
            },
        },
        test_utils::{create_test_ticket, create_test_user},
    };
    use chrono::{Duration, Utc};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_time_report_groups_and_bills(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let org = Organizations::new(&mut conn)
            .create(&OrganizationCreateDBRequest {
                name: "Billable Co".to_string(),
                email_domain: None,
                billable_rate: Some(Decimal::new(12000, 2)),
                notes: None,
            })
            .await
            .unwrap();
        Tickets::new(&mut conn)
            .update(
                ticket.id,
                &TicketUpdateDBRequest {
                    organization_id: Some(org.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut entries = TimeEntries::new(&mut conn);
        for (minutes, billable) in [(30, true), (15, false)] {
            entries
                .create(&TimeEntryCreateDBRequest {
                    ticket_id: ticket.id,
                    user_id: agent.id,
                    started_at: now - Duration::hours(1),
                    ended_at: Some(now - Duration::hours(1) + Duration::minutes(minutes)),
                    duration_minutes: Some(minutes as i32),
                    billable,
                    note: None,
                })
                .await
                .unwrap();
        }

        let filters = TimeReportFilters {
            from: now - Duration::days(1),
            to: now + Duration::days(1),
            group_by: TimeGrouping::Organization,
            organization_id: None,
            agent_id: None,
            billable_only: false,
        };
        let report = Reports::new(&mut conn).time_report(&filters).await.unwrap();
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row.label, "Billable Co");
        assert_eq!(row.total_minutes, 45);
        assert_eq!(row.billable_minutes, 30);
        assert_eq!(row.entry_count, 2);
        assert_eq!(row.billable_amount, Decimal::new(6000, 2));
        assert_eq!(report.billable_amount, Decimal::new(6000, 2));

        let by_agent = Reports::new(&mut conn)
            .time_report(&TimeReportFilters {
                group_by: TimeGrouping::Agent,
                billable_only: true,
                ..filters.clone()
            })
            .await
            .unwrap();
        assert_eq!(by_agent.rows.len(), 1);
        assert_eq!(by_agent.rows[0].key, agent.id.to_string());
        assert_eq!(by_agent.total_minutes, 30);

        let outside = Reports::new(&mut conn)
            .time_report(&TimeReportFilters {
                from: now + Duration::days(1),
                to: now + Duration::days(2),
                ..filters
            })
            .await
            .unwrap();
        assert!(outside.rows.is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_ticket_report(pool: PgPool) {
        create_test_ticket(&pool).await;
        create_test_ticket(&pool).await;
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let report = Reports::new(&mut conn)
            .ticket_report(&TicketReportFilters {
                from: now - Duration::hours(1),
                to: now + Duration::hours(1),
                organization_id: None,
            })
            .await
            .unwrap();

        assert_eq!(report.created, 2);
        assert_eq!(report.closed, 0);
        let open = report.open_by_status.iter().find(|r| r.label == "Open").unwrap();
        assert_eq!(open.count, 2);
        assert!(report.open_by_status.iter().all(|r| r.label != "Closed"));
        let normal = report.created_by_priority.iter().find(|r| r.label == "Normal").unwrap();
        assert_eq!(normal.count, 2);
        assert_eq!(report.created_by_type.len(), 3);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_templates_crud(pool: PgPool) {
        let owner = create_test_user(&pool, Role::Agent).await;
        let other = create_test_user(&pool, Role::Agent).await;

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = ReportTemplates::new(&mut conn);
        let template = repo
            .create(&ReportTemplateCreateDBRequest {
                name: "Monthly billing".to_string(),
                owner_id: owner.id,
                kind: ReportKind::Time,
                filters: serde_json::json!({"group_by": "organization"}),
            })
            .await
            .unwrap();
        assert_eq!(template.kind, ReportKind::Time);

        assert_eq!(repo.list(Some(owner.id)).await.unwrap().len(), 1);
        assert!(repo.list(Some(other.id)).await.unwrap().is_empty());
        assert_eq!(repo.list(None).await.unwrap().len(), 1);

        let renamed = repo
            .update(
                template.id,
                &ReportTemplateUpdateDBRequest {
                    name: Some("Billing".to_string()),
                    filters: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Billing");
        assert_eq!(renamed.filters["group_by"], "organization");

        assert!(repo.delete(template.id).await.unwrap());
        assert!(repo.get_by_id(template.id).await.unwrap().is_none());
    }
}
