use crate::{
    AppState,
    api::models::{
        reports::{ReportRunResponse, ReportTemplateCreate, ReportTemplateResponse, ReportTemplateUpdate, TemplateFilters},
        users::CurrentUser,
    },
    auth::permissions::{RequiresPermission, has_permission, operation, resource},
    db::{
        errors::DbError,
        handlers::{ReportTemplates, Reports},
        models::reports::{
            ReportTemplateCreateDBRequest, ReportTemplateDBResponse, ReportTemplateUpdateDBRequest, TicketReport, TicketReportFilters,
            TimeReport, TimeReportFilters,
        },
    },
    errors::{Error, Result},
    types::{Operation, ReportTemplateId, Resource},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use sqlx::PgConnection;

/// Admins see and manage every template; everyone else only their own.
fn manages_all_templates(user: &CurrentUser) -> bool {
    has_permission(user, Resource::Reports, Operation::UpdateAll)
}

fn validate_range(from: chrono::DateTime<chrono::Utc>, to: chrono::DateTime<chrono::Utc>) -> Result<()> {
    if from >= to {
        return Err(Error::BadRequest {
            message: "Report range must end after it starts".to_string(),
        });
    }
    Ok(())
}

async fn accessible_template(conn: &mut PgConnection, user: &CurrentUser, id: ReportTemplateId) -> Result<ReportTemplateDBResponse> {
    match ReportTemplates::new(conn).get_by_id(id).await? {
        Some(template) if template.owner_id == user.id || manages_all_templates(user) => Ok(template),
        _ => Err(Error::NotFound {
            resource: "Report template".to_string(),
            id: id.to_string(),
        }),
    }
}

#[utoipa::path(
    get,
    path = "/reports/time",
    tag = "reports",
    summary = "Time report",
    description = "Logged minutes in `[from, to)`, grouped by organization, agent, ticket or day, with billable amounts.",
    responses(
        (status = 200, description = "Time report", body = TimeReport),
        (status = 400, description = "Invalid range"),
        (status = 403, description = "Forbidden"),
    ),
    params(TimeReportFilters),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn time_report(
    State(state): State<AppState>,
    Query(filters): Query<TimeReportFilters>,
    _: RequiresPermission<resource::Reports, operation::ReadAll>,
) -> Result<Json<TimeReport>> {
    validate_range(filters.from, filters.to)?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Ok(Json(Reports::new(&mut conn).time_report(&filters).await?))
}

#[utoipa::path(
    get,
    path = "/reports/tickets",
    tag = "reports",
    summary = "Ticket report",
    description = "Tickets created and closed in `[from, to)` plus the current open backlog.",
    responses(
        (status = 200, description = "Ticket report", body = TicketReport),
        (status = 400, description = "Invalid range"),
        (status = 403, description = "Forbidden"),
    ),
    params(TicketReportFilters),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn ticket_report(
    State(state): State<AppState>,
    Query(filters): Query<TicketReportFilters>,
    _: RequiresPermission<resource::Reports, operation::ReadAll>,
) -> Result<Json<TicketReport>> {
    validate_range(filters.from, filters.to)?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Ok(Json(Reports::new(&mut conn).ticket_report(&filters).await?))
}

#[utoipa::path(
    get,
    path = "/reports/templates",
    tag = "reports",
    summary = "List report templates",
    responses(
        (status = 200, description = "Saved templates", body = Vec<ReportTemplateResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_report_templates(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Reports, operation::ReadOwn>,
) -> Result<Json<Vec<ReportTemplateResponse>>> {
    let user = current_user.user;
    let owner = if manages_all_templates(&user) { None } else { Some(user.id) };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let templates = ReportTemplates::new(&mut conn).list(owner).await?;
    Ok(Json(templates.into_iter().map(ReportTemplateResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/reports/templates",
    tag = "reports",
    summary = "Save report template",
    request_body = ReportTemplateCreate,
    responses(
        (status = 201, description = "Template saved", body = ReportTemplateResponse),
        (status = 400, description = "Filters do not match the report kind"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "You already have a template with this name"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_report_template(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Reports, operation::CreateOwn>,
    Json(create): Json<ReportTemplateCreate>,
) -> Result<(StatusCode, Json<ReportTemplateResponse>)> {
    let name = create.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::BadRequest {
            message: "A report template needs a name".to_string(),
        });
    }
    TemplateFilters::parse(create.kind, &create.filters)?;

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let template = ReportTemplates::new(&mut conn)
        .create(&ReportTemplateCreateDBRequest {
            name,
            owner_id: current_user.user.id,
            kind: create.kind,
            filters: create.filters,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ReportTemplateResponse::from(template))))
}

#[utoipa::path(
    get,
    path = "/reports/templates/{template_id}",
    tag = "reports",
    summary = "Get report template",
    responses(
        (status = 200, description = "Template", body = ReportTemplateResponse),
        (status = 404, description = "Template not found"),
    ),
    params(("template_id" = uuid::Uuid, Path, description = "Template ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_report_template(
    State(state): State<AppState>,
    Path(template_id): Path<ReportTemplateId>,
    current_user: RequiresPermission<resource::Reports, operation::ReadOwn>,
) -> Result<Json<ReportTemplateResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let template = accessible_template(&mut conn, &current_user.user, template_id).await?;
    Ok(Json(ReportTemplateResponse::from(template)))
}

#[utoipa::path(
    patch,
    path = "/reports/templates/{template_id}",
    tag = "reports",
    summary = "Update report template",
    request_body = ReportTemplateUpdate,
    responses(
        (status = 200, description = "Template updated", body = ReportTemplateResponse),
        (status = 400, description = "Filters do not match the report kind"),
        (status = 404, description = "Template not found"),
    ),
    params(("template_id" = uuid::Uuid, Path, description = "Template ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_report_template(
    State(state): State<AppState>,
    Path(template_id): Path<ReportTemplateId>,
    current_user: RequiresPermission<resource::Reports, operation::UpdateOwn>,
    Json(update): Json<ReportTemplateUpdate>,
) -> Result<Json<ReportTemplateResponse>> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let existing = accessible_template(&mut tx, &current_user.user, template_id).await?;

    if let Some(filters) = &update.filters {
        TemplateFilters::parse(existing.kind, filters)?;
    }
    let name = update.name.map(|n| n.trim().to_string());
    if name.as_deref().is_some_and(str::is_empty) {
        return Err(Error::BadRequest {
            message: "A report template needs a name".to_string(),
        });
    }

    let template = ReportTemplates::new(&mut tx)
        .update(
            template_id,
            &ReportTemplateUpdateDBRequest {
                name,
                filters: update.filters,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => Error::NotFound {
                resource: "Report template".to_string(),
                id: template_id.to_string(),
            },
            other => other.into(),
        })?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(ReportTemplateResponse::from(template)))
}

#[utoipa::path(
    delete,
    path = "/reports/templates/{template_id}",
    tag = "reports",
    summary = "Delete report template",
    responses(
        (status = 204, description = "Template deleted"),
        (status = 404, description = "Template not found"),
    ),
    params(("template_id" = uuid::Uuid, Path, description = "Template ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_report_template(
    State(state): State<AppState>,
    Path(template_id): Path<ReportTemplateId>,
    current_user: RequiresPermission<resource::Reports, operation::DeleteOwn>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    accessible_template(&mut conn, &current_user.user, template_id).await?;
    ReportTemplates::new(&mut conn).delete(template_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a saved template
///
/// Runs the report the template describes with its stored filters.
#[utoipa::path(
    post,
    path = "/reports/templates/{template_id}/run",
    tag = "reports",
    summary = "Run report template",
    responses(
        (status = 200, description = "Report result", body = ReportRunResponse),
        (status = 400, description = "Stored filters are no longer valid"),
        (status = 404, description = "Template not found"),
    ),
    params(("template_id" = uuid::Uuid, Path, description = "Template ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn run_report_template(
    State(state): State<AppState>,
    Path(template_id): Path<ReportTemplateId>,
    current_user: RequiresPermission<resource::Reports, operation::ReadAll>,
) -> Result<Json<ReportRunResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let template = accessible_template(&mut conn, &current_user.user, template_id).await?;

    let (time, tickets) = match TemplateFilters::parse(template.kind, &template.filters)? {
        TemplateFilters::Time(filters) => (Some(Reports::new(&mut conn).time_report(&filters).await?), None),
        TemplateFilters::Tickets(filters) => (None, Some(Reports::new(&mut conn).ticket_report(&filters).await?)),
    };

    Ok(Json(ReportRunResponse {
        template: ReportTemplateResponse::from(template),
        time,
        tickets,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::reports::ReportKind,
        test_utils::{bearer_token, create_test_app, create_test_organization, create_test_ticket, create_test_user},
    };
    use chrono::{Duration, SubsecRound, Utc};
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_time_report_with_billable_amount(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let organization = create_test_organization(&pool).await;
        sqlx::query("UPDATE organizations SET billable_rate = 120 WHERE id = $1")
            .bind(organization.id)
            .execute(&pool)
            .await
            .unwrap();
        let ticket = create_test_ticket(&pool).await;
        sqlx::query("UPDATE tickets SET organization_id = $1 WHERE id = $2")
            .bind(organization.id)
            .bind(ticket.id)
            .execute(&pool)
            .await
            .unwrap();
        let server = create_test_app(pool);

        let started_at = (Utc::now() - Duration::hours(2)).trunc_subsecs(0);
        for (minutes, billable) in [(30, true), (15, false)] {
            server
                .post(&format!("/api/v1/tickets/{}/time-entries", ticket.id))
                .authorization_bearer(bearer_token(&agent))
                .json(&json!({"started_at": started_at, "duration_minutes": minutes, "billable": billable}))
                .await
                .assert_status(StatusCode::CREATED);
        }

        let from = (started_at - Duration::days(1)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let to = (started_at + Duration::days(1)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let response = server
            .get(&format!("/api/v1/reports/time?from={from}&to={to}&group_by=organization"))
            .authorization_bearer(bearer_token(&agent))
            .await;
        response.assert_status_ok();
        let report: Value = response.json();
        assert_eq!(report["total_minutes"], 45);
        assert_eq!(report["billable_minutes"], 30);
        assert_eq!(report["rows"].as_array().unwrap().len(), 1);
        assert_eq!(report["rows"][0]["entry_count"], 2);
        let amount: Decimal = serde_json::from_value(report["billable_amount"].clone()).unwrap();
        assert_eq!(amount, Decimal::from(60));

        server
            .get(&format!("/api/v1/reports/time?from={to}&to={from}"))
            .authorization_bearer(bearer_token(&agent))
            .await
            .assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_clients_cannot_run_reports(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        server
            .get("/api/v1/reports/tickets?from=2025-01-01T00:00:00Z&to=2025-02-01T00:00:00Z")
            .authorization_bearer(bearer_token(&client))
            .await
            .assert_status_forbidden();
        server
            .get("/api/v1/reports/templates")
            .authorization_bearer(bearer_token(&client))
            .await
            .assert_status_forbidden();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_template_crud_and_run(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let colleague = create_test_user(&pool, Role::Agent).await;
        let admin = create_test_user(&pool, Role::Admin).await;
        create_test_ticket(&pool).await;
        let server = create_test_app(pool);

        let from = Utc::now() - Duration::days(7);
        let to = Utc::now() + Duration::days(1);

        let response = server
            .post("/api/v1/reports/templates")
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"name": "Weekly tickets", "kind": "tickets", "filters": {"from": from, "to": to}}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let template: ReportTemplateResponse = response.json();
        assert_eq!(template.kind, ReportKind::Tickets);
        assert_eq!(template.owner_id, agent.id);

        server
            .post("/api/v1/reports/templates")
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"name": "Broken", "kind": "time", "filters": {"from": from}}))
            .await
            .assert_status_bad_request();

        let run: ReportRunResponse = server
            .post(&format!("/api/v1/reports/templates/{}/run", template.id))
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert!(run.time.is_none());
        assert_eq!(run.tickets.unwrap().created, 1);

        server
            .get(&format!("/api/v1/reports/templates/{}", template.id))
            .authorization_bearer(bearer_token(&colleague))
            .await
            .assert_status_not_found();
        let colleague_templates: Vec<ReportTemplateResponse> = server
            .get("/api/v1/reports/templates")
            .authorization_bearer(bearer_token(&colleague))
            .await
            .json();
        assert!(colleague_templates.is_empty());
        let all_templates: Vec<ReportTemplateResponse> = server
            .get("/api/v1/reports/templates")
            .authorization_bearer(bearer_token(&admin))
            .await
            .json();
        assert_eq!(all_templates.len(), 1);

        let renamed: ReportTemplateResponse = server
            .patch(&format!("/api/v1/reports/templates/{}", template.id))
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"name": "Last week"}))
            .await
            .json();
        assert_eq!(renamed.name, "Last week");

        server
            .delete(&format!("/api/v1/reports/templates/{}", template.id))
            .authorization_bearer(bearer_token(&agent))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }
}
