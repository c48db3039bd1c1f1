use crate::{
    AppState,
    api::models::{
        ingest::{IngestLogResponse, IngestRunResponse, ListIngestLogsQuery},
        pagination::{PaginatedResponse, Pagination},
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::handlers::{IngestLogs, IngestRuns, ingest::IngestLogFilter},
    errors::{Error, Result},
    ingest::RunTrigger,
    types::IngestRunId,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::info;

#[utoipa::path(
    get,
    path = "/ingest/runs",
    tag = "ingest",
    summary = "List ingest runs",
    description = "Most recent first.",
    responses(
        (status = 200, description = "Paginated runs", body = PaginatedResponse<IngestRunResponse>),
        (status = 403, description = "Forbidden"),
    ),
    params(Pagination),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_ingest_runs(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    _: RequiresPermission<resource::Ingest, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<IngestRunResponse>>> {
    let (skip, limit) = pagination.params();
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = IngestRuns::new(&mut conn);
    let runs = repo.list(skip, limit).await?;
    let total_count = repo.count().await?;

    Ok(Json(PaginatedResponse::new(
        runs.into_iter().map(IngestRunResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

#[utoipa::path(
    get,
    path = "/ingest/runs/{run_id}",
    tag = "ingest",
    summary = "Get ingest run",
    responses(
        (status = 200, description = "Run", body = IngestRunResponse),
        (status = 404, description = "Run not found"),
    ),
    params(("run_id" = uuid::Uuid, Path, description = "Run ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_ingest_run(
    State(state): State<AppState>,
    Path(run_id): Path<IngestRunId>,
    _: RequiresPermission<resource::Ingest, operation::ReadAll>,
) -> Result<Json<IngestRunResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let run = IngestRuns::new(&mut conn).get_by_id(run_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Ingest run".to_string(),
        id: run_id.to_string(),
    })?;
    Ok(Json(IngestRunResponse::from(run)))
}

/// Trigger an ingest run
///
/// Polls the mailbox now instead of waiting for the scheduler. Only one run can be active
/// across all instances.
#[utoipa::path(
    post,
    path = "/ingest/runs",
    tag = "ingest",
    summary = "Run ingestion now",
    responses(
        (status = 201, description = "Run finished", body = IngestRunResponse),
        (status = 400, description = "Email ingestion is disabled"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Another run is in progress"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn trigger_ingest_run(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::Ingest, operation::CreateAll>,
) -> Result<(StatusCode, Json<IngestRunResponse>)> {
    if !state.config.ingest.enabled {
        return Err(Error::BadRequest {
            message: "Email ingestion is disabled".to_string(),
        });
    }

    info!(user_id = %current_user.user.id, "Manual ingest run requested");
    match state.ingest.run(RunTrigger::Manual).await? {
        Some(run) => Ok((StatusCode::CREATED, Json(IngestRunResponse::from(run)))),
        None => Err(Error::Conflict {
            message: "An ingest run is already in progress".to_string(),
        }),
    }
}

#[utoipa::path(
    get,
    path = "/ingest/logs",
    tag = "ingest",
    summary = "List ingest logs",
    description = "One entry per processed message, most recent first.",
    responses(
        (status = 200, description = "Paginated logs", body = PaginatedResponse<IngestLogResponse>),
        (status = 403, description = "Forbidden"),
    ),
    params(ListIngestLogsQuery),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_ingest_logs(
    State(state): State<AppState>,
    Query(query): Query<ListIngestLogsQuery>,
    _: RequiresPermission<resource::Ingest, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<IngestLogResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = IngestLogFilter {
        skip,
        limit,
        run_id: query.run_id,
        outcome: query.outcome,
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = IngestLogs::new(&mut conn);
    let logs = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        logs.into_iter().map(IngestLogResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}
