use crate::{
    AppState,
    api::{
        handlers::tickets::ensure_assignable,
        models::{
            pagination::PaginatedResponse,
            recurring_tasks::{ListRecurringTasksQuery, RecurringTaskCreate, RecurringTaskResponse, RecurringTaskUpdate},
        },
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Repository, RecurringTasks, recurring_tasks::RecurringTaskFilter},
        models::recurring_tasks::{Recurrence, RecurringTaskCreateDBRequest, RecurringTaskUpdateDBRequest, next_occurrence},
    },
    errors::{Error, Result},
    types::RecurringTaskId,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};

const MAX_INTERVAL: i32 = 365;

fn task_not_found(id: RecurringTaskId) -> Error {
    Error::NotFound {
        resource: "Recurring task".to_string(),
        id: id.to_string(),
    }
}

fn validate_interval(interval_count: i32) -> Result<u32> {
    if !(1..=MAX_INTERVAL).contains(&interval_count) {
        return Err(Error::BadRequest {
            message: format!("interval_count must be between 1 and {MAX_INTERVAL}"),
        });
    }
    Ok(interval_count.unsigned_abs())
}

fn validate_subject(subject: &str) -> Result<()> {
    if subject.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "Subject must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Next run for a rescheduled task: the anchor when it is still ahead, otherwise the first
/// occurrence after now.
fn reschedule(recurrence: Recurrence, interval: u32, starts_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    next_occurrence(recurrence, interval, starts_at, now).ok_or_else(|| Error::BadRequest {
        message: "Schedule has no future occurrence".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/recurring-tasks",
    tag = "recurring_tasks",
    summary = "List recurring tasks",
    description = "Ordered by next run time.",
    responses(
        (status = 200, description = "Paginated recurring tasks", body = PaginatedResponse<RecurringTaskResponse>),
        (status = 403, description = "Forbidden"),
    ),
    params(ListRecurringTasksQuery),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_recurring_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListRecurringTasksQuery>,
    _: RequiresPermission<resource::RecurringTasks, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<RecurringTaskResponse>>> {
    let (skip, limit) = query.pagination.params();
    let filter = RecurringTaskFilter {
        skip,
        limit,
        active_only: query.active_only.unwrap_or(false),
    };

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = RecurringTasks::new(&mut conn);
    let tasks = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        tasks.into_iter().map(RecurringTaskResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

/// Create a recurring task
///
/// The first ticket is opened at `starts_at`; later ones follow the recurrence.
#[utoipa::path(
    post,
    path = "/recurring-tasks",
    tag = "recurring_tasks",
    summary = "Create recurring task",
    request_body = RecurringTaskCreate,
    responses(
        (status = 201, description = "Recurring task created", body = RecurringTaskResponse),
        (status = 400, description = "Invalid schedule or references"),
        (status = 403, description = "Forbidden"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_recurring_task(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::RecurringTasks, operation::CreateAll>,
    Json(create): Json<RecurringTaskCreate>,
) -> Result<(StatusCode, Json<RecurringTaskResponse>)> {
    validate_subject(&create.subject)?;
    validate_interval(create.interval_count)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    if let Some(assignee_id) = create.assignee_id {
        ensure_assignable(&mut tx, assignee_id).await?;
    }

    let task = RecurringTasks::new(&mut tx)
        .create(&RecurringTaskCreateDBRequest {
            subject: create.subject,
            description: create.description,
            requester_id: create.requester_id,
            organization_id: create.organization_id,
            assignee_id: create.assignee_id,
            priority_id: create.priority_id,
            ticket_type_id: create.ticket_type_id,
            recurrence: create.recurrence,
            interval_count: create.interval_count,
            starts_at: create.starts_at,
            created_by: Some(current_user.user.id),
        })
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok((StatusCode::CREATED, Json(RecurringTaskResponse::from(task))))
}

#[utoipa::path(
    get,
    path = "/recurring-tasks/{task_id}",
    tag = "recurring_tasks",
    summary = "Get recurring task",
    responses(
        (status = 200, description = "Recurring task", body = RecurringTaskResponse),
        (status = 404, description = "Recurring task not found"),
    ),
    params(("task_id" = uuid::Uuid, Path, description = "Recurring task ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_recurring_task(
    State(state): State<AppState>,
    Path(task_id): Path<RecurringTaskId>,
    _: RequiresPermission<resource::RecurringTasks, operation::ReadAll>,
) -> Result<Json<RecurringTaskResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let task = RecurringTasks::new(&mut conn)
        .get_by_id(task_id)
        .await?
        .ok_or_else(|| task_not_found(task_id))?;
    Ok(Json(RecurringTaskResponse::from(task)))
}

/// Update a recurring task
///
/// Changing `recurrence`, `interval_count` or `starts_at` moves the next run to the first
/// occurrence of the new schedule that is not in the past.
#[utoipa::path(
    patch,
    path = "/recurring-tasks/{task_id}",
    tag = "recurring_tasks",
    summary = "Update recurring task",
    request_body = RecurringTaskUpdate,
    responses(
        (status = 200, description = "Recurring task updated", body = RecurringTaskResponse),
        (status = 400, description = "Invalid schedule or references"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Recurring task not found"),
    ),
    params(("task_id" = uuid::Uuid, Path, description = "Recurring task ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_recurring_task(
    State(state): State<AppState>,
    Path(task_id): Path<RecurringTaskId>,
    _: RequiresPermission<resource::RecurringTasks, operation::UpdateAll>,
    Json(update): Json<RecurringTaskUpdate>,
) -> Result<Json<RecurringTaskResponse>> {
    if let Some(subject) = &update.subject {
        validate_subject(subject)?;
    }
    if let Some(interval_count) = update.interval_count {
        validate_interval(interval_count)?;
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let existing = RecurringTasks::new(&mut tx)
        .get_by_id(task_id)
        .await?
        .ok_or_else(|| task_not_found(task_id))?;

    if let Some(assignee_id) = update.assignee_id
        && !update.clear_assignee
    {
        ensure_assignable(&mut tx, assignee_id).await?;
    }

    let schedule_changed = update.recurrence.is_some() || update.interval_count.is_some() || update.starts_at.is_some();
    let reactivated = update.is_active == Some(true) && !existing.is_active;
    let next_run_at = if schedule_changed || reactivated {
        let recurrence = update.recurrence.unwrap_or(existing.recurrence);
        let interval = match update.interval_count {
            Some(count) => validate_interval(count)?,
            None => existing.interval(),
        };
        let starts_at = update.starts_at.unwrap_or(existing.starts_at);
        Some(reschedule(recurrence, interval, starts_at, Utc::now())?)
    } else {
        None
    };

    let task = RecurringTasks::new(&mut tx)
        .update(
            task_id,
            &RecurringTaskUpdateDBRequest {
                subject: update.subject,
                description: update.description,
                assignee_id: update.assignee_id,
                clear_assignee: update.clear_assignee,
                priority_id: update.priority_id,
                ticket_type_id: update.ticket_type_id,
                recurrence: update.recurrence,
                interval_count: update.interval_count,
                starts_at: update.starts_at,
                next_run_at,
                is_active: update.is_active,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => task_not_found(task_id),
            other => other.into(),
        })?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok(Json(RecurringTaskResponse::from(task)))
}

#[utoipa::path(
    delete,
    path = "/recurring-tasks/{task_id}",
    tag = "recurring_tasks",
    summary = "Delete recurring task",
    description = "Tickets already created by the task are kept.",
    responses(
        (status = 204, description = "Recurring task deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Recurring task not found"),
    ),
    params(("task_id" = uuid::Uuid, Path, description = "Recurring task ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_recurring_task(
    State(state): State<AppState>,
    Path(task_id): Path<RecurringTaskId>,
    _: RequiresPermission<resource::RecurringTasks, operation::DeleteAll>,
) -> Result<StatusCode> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    if RecurringTasks::new(&mut conn).delete(task_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(task_not_found(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{bearer_token, create_test_app, create_test_user},
    };
    use chrono::{Duration, SubsecRound, TimeZone};
    use serde_json::json;
    use sqlx::PgPool;

    #[test]
    fn test_reschedule_skips_past_occurrences() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap();
        assert_eq!(
            reschedule(Recurrence::Weekly, 1, anchor, now).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
        );
        let future = now + Duration::days(3);
        assert_eq!(reschedule(Recurrence::Daily, 1, future, now).unwrap(), future);
    }

    #[test]
    fn test_interval_bounds() {
        assert!(validate_interval(0).is_err());
        assert!(validate_interval(MAX_INTERVAL + 1).is_err());
        assert_eq!(validate_interval(2).unwrap(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_admin_manages_recurring_tasks(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let starts_at = (Utc::now() + Duration::days(2)).trunc_subsecs(0);
        let body = json!({
            "subject": "Monthly backup check",
            "requester_id": client.id,
            "assignee_id": agent.id,
            "recurrence": "monthly",
            "starts_at": starts_at,
        });

        server
            .post("/api/v1/recurring-tasks")
            .authorization_bearer(bearer_token(&agent))
            .json(&body)
            .await
            .assert_status_forbidden();

        let response = server
            .post("/api/v1/recurring-tasks")
            .authorization_bearer(bearer_token(&admin))
            .json(&body)
            .await;
        response.assert_status(StatusCode::CREATED);
        let task: RecurringTaskResponse = response.json();
        assert_eq!(task.interval_count, 1);
        assert_eq!(task.next_run_at, starts_at);
        assert!(task.is_active);

        let listed: PaginatedResponse<RecurringTaskResponse> = server
            .get("/api/v1/recurring-tasks?active_only=true")
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert_eq!(listed.total_count, 1);

        let paused: RecurringTaskResponse = server
            .patch(&format!("/api/v1/recurring-tasks/{}", task.id))
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"is_active": false, "clear_assignee": true}))
            .await
            .json();
        assert!(!paused.is_active);
        assert!(paused.assignee_id.is_none());

        let listed: PaginatedResponse<RecurringTaskResponse> = server
            .get("/api/v1/recurring-tasks?active_only=true")
            .authorization_bearer(bearer_token(&admin))
            .await
            .json();
        assert_eq!(listed.total_count, 0);

        server
            .delete(&format!("/api/v1/recurring-tasks/{}", task.id))
            .authorization_bearer(bearer_token(&admin))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .get(&format!("/api/v1/recurring-tasks/{}", task.id))
            .authorization_bearer(bearer_token(&admin))
            .await
            .assert_status_not_found();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_schedule_change_moves_next_run(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);

        let starts_at = (Utc::now() - Duration::days(10)).trunc_subsecs(0);
        let task: RecurringTaskResponse = server
            .post("/api/v1/recurring-tasks")
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({
                "subject": "Rotate logs",
                "requester_id": client.id,
                "recurrence": "daily",
                "starts_at": starts_at,
            }))
            .await
            .json();
        assert_eq!(task.next_run_at, starts_at);

        let before = Utc::now();
        let updated: RecurringTaskResponse = server
            .patch(&format!("/api/v1/recurring-tasks/{}", task.id))
            .authorization_bearer(bearer_token(&admin))
            .json(&json!({"recurrence": "weekly"}))
            .await
            .json();
        assert!(updated.next_run_at > before);
        assert!(updated.next_run_at <= before + Duration::weeks(1));
        assert_eq!((updated.next_run_at - starts_at).num_days() % 7, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_invalid_recurring_tasks_rejected(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let client = create_test_user(&pool, Role::User).await;
        let server = create_test_app(pool);
        let starts_at = Utc::now() + Duration::days(1);

        for body in [
            json!({"subject": " ", "requester_id": client.id, "recurrence": "daily", "starts_at": starts_at}),
            json!({"subject": "x", "requester_id": client.id, "recurrence": "daily", "interval_count": 0, "starts_at": starts_at}),
            json!({"subject": "x", "requester_id": client.id, "assignee_id": client.id, "recurrence": "daily", "starts_at": starts_at}),
        ] {
            server
                .post("/api/v1/recurring-tasks")
                .authorization_bearer(bearer_token(&admin))
                .json(&body)
                .await
                .assert_status_bad_request();
        }
    }
}
