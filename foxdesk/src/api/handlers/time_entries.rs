use crate::{
    AppState,
    api::models::time_entries::{TimeEntryCreate, TimeEntryResponse, TimerStart},
    auth::permissions::{RequiresPermission, has_permission, operation, resource},
    db::{
        handlers::{Repository, TimeEntries, Tickets},
        models::time_entries::{TimeEntryCreateDBRequest, billable_minutes},
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, TicketId, TimeEntryId, abbrev_uuid},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use sqlx::PgConnection;
use tracing::info;

async fn ensure_ticket_exists(conn: &mut PgConnection, ticket_id: TicketId) -> Result<()> {
    match Tickets::new(conn).get_by_id(ticket_id).await? {
        Some(_) => Ok(()),
        None => Err(Error::NotFound {
            resource: "Ticket".to_string(),
            id: ticket_id.to_string(),
        }),
    }
}

fn clean_note(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

#[utoipa::path(
    post,
    path = "/tickets/{ticket_id}/timer",
    tag = "time_entries",
    summary = "Start timer",
    request_body = TimerStart,
    responses(
        (status = 201, description = "Timer started", body = TimeEntryResponse),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
        (status = 409, description = "A timer is already running for this user"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn start_timer(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::TimeEntries, operation::CreateOwn>,
    Json(start): Json<TimerStart>,
) -> Result<(StatusCode, Json<TimeEntryResponse>)> {
    let user = current_user.user;
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    ensure_ticket_exists(&mut tx, ticket_id).await?;

    if let Some(running) = TimeEntries::new(&mut tx).running_for_user(user.id).await? {
        return Err(Error::Conflict {
            message: format!("A timer is already running on ticket {}", running.ticket_id),
        });
    }

    // Two racing starts both pass the check above; the partial unique index rejects the second
    let entry = TimeEntries::new(&mut tx)
        .create(&TimeEntryCreateDBRequest {
            ticket_id,
            user_id: user.id,
            started_at: Utc::now(),
            ended_at: None,
            duration_minutes: None,
            billable: start.billable,
            note: clean_note(start.note),
        })
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    info!(ticket_id = %abbrev_uuid(&ticket_id), "Timer started");
    Ok((StatusCode::CREATED, Json(TimeEntryResponse::from(entry))))
}

#[utoipa::path(
    get,
    path = "/time-entries/timer",
    tag = "time_entries",
    summary = "Running timer",
    responses(
        (status = 200, description = "The caller's running timer, or null", body = Option<TimeEntryResponse>),
        (status = 403, description = "Forbidden"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_running_timer(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::TimeEntries, operation::ReadOwn>,
) -> Result<Json<Option<TimeEntryResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let running = TimeEntries::new(&mut conn).running_for_user(current_user.user.id).await?;
    Ok(Json(running.map(TimeEntryResponse::from)))
}

/// Stop the running timer
///
/// The duration is rounded up to whole minutes, with a minimum of one.
#[utoipa::path(
    post,
    path = "/time-entries/timer/stop",
    tag = "time_entries",
    summary = "Stop timer",
    responses(
        (status = 200, description = "Timer stopped", body = TimeEntryResponse),
        (status = 400, description = "No timer is running"),
        (status = 403, description = "Forbidden"),
    ),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn stop_timer(
    State(state): State<AppState>,
    current_user: RequiresPermission<resource::TimeEntries, operation::UpdateOwn>,
) -> Result<Json<TimeEntryResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let entry = TimeEntries::new(&mut conn)
        .stop_running(current_user.user.id)
        .await?
        .ok_or_else(|| Error::BadRequest {
            message: "No timer is running".to_string(),
        })?;

    info!(ticket_id = %abbrev_uuid(&entry.ticket_id), minutes = ?entry.duration_minutes, "Timer stopped");
    Ok(Json(TimeEntryResponse::from(entry)))
}

#[utoipa::path(
    get,
    path = "/tickets/{ticket_id}/time-entries",
    tag = "time_entries",
    summary = "List time entries",
    responses(
        (status = 200, description = "Time entries on the ticket, oldest first", body = Vec<TimeEntryResponse>),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_time_entries(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    _: RequiresPermission<resource::TimeEntries, operation::ReadAll>,
) -> Result<Json<Vec<TimeEntryResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    ensure_ticket_exists(&mut conn, ticket_id).await?;
    let entries = TimeEntries::new(&mut conn).list_for_ticket(ticket_id).await?;
    Ok(Json(entries.into_iter().map(TimeEntryResponse::from).collect()))
}

/// Log a manual time entry
///
/// Give either `ended_at` or `duration_minutes`. Durations are whole minutes, at least one.
#[utoipa::path(
    post,
    path = "/tickets/{ticket_id}/time-entries",
    tag = "time_entries",
    summary = "Log time",
    request_body = TimeEntryCreate,
    responses(
        (status = 201, description = "Time entry created", body = TimeEntryResponse),
        (status = 400, description = "Invalid times"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Ticket not found"),
    ),
    params(("ticket_id" = uuid::Uuid, Path, description = "Ticket ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn create_time_entry(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
    current_user: RequiresPermission<resource::TimeEntries, operation::CreateOwn>,
    Json(create): Json<TimeEntryCreate>,
) -> Result<(StatusCode, Json<TimeEntryResponse>)> {
    let (ended_at, duration_minutes) = match (create.ended_at, create.duration_minutes) {
        (Some(ended_at), None) => {
            if ended_at <= create.started_at {
                return Err(Error::BadRequest {
                    message: "ended_at must be after started_at".to_string(),
                });
            }
            (ended_at, billable_minutes(create.started_at, ended_at))
        }
        (None, Some(minutes)) => {
            if minutes < 1 {
                return Err(Error::BadRequest {
                    message: "duration_minutes must be at least 1".to_string(),
                });
            }
            (create.started_at + Duration::minutes(i64::from(minutes)), minutes)
        }
        _ => {
            return Err(Error::BadRequest {
                message: "Give either ended_at or duration_minutes".to_string(),
            });
        }
    };

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    ensure_ticket_exists(&mut tx, ticket_id).await?;
    let entry = TimeEntries::new(&mut tx)
        .create(&TimeEntryCreateDBRequest {
            ticket_id,
            user_id: current_user.user.id,
            started_at: create.started_at,
            ended_at: Some(ended_at),
            duration_minutes: Some(duration_minutes),
            billable: create.billable,
            note: clean_note(create.note),
        })
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    Ok((StatusCode::CREATED, Json(TimeEntryResponse::from(entry))))
}

#[utoipa::path(
    delete,
    path = "/time-entries/{time_entry_id}",
    tag = "time_entries",
    summary = "Delete time entry",
    description = "Agents delete their own entries; admins may delete any.",
    responses(
        (status = 204, description = "Time entry deleted"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Time entry not found"),
    ),
    params(("time_entry_id" = uuid::Uuid, Path, description = "Time entry ID")),
    security(("BearerAuth" = []), ("CookieAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_time_entry(
    State(state): State<AppState>,
    Path(time_entry_id): Path<TimeEntryId>,
    current_user: RequiresPermission<resource::TimeEntries, operation::DeleteOwn>,
) -> Result<StatusCode> {
    let user = current_user.user;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = TimeEntries::new(&mut conn);

    let entry = repo.get_by_id(time_entry_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Time entry".to_string(),
        id: time_entry_id.to_string(),
    })?;

    if entry.user_id != user.id && !has_permission(&user, Resource::TimeEntries, Operation::DeleteAll) {
        return Err(Error::InsufficientPermissions {
            required: Permission::Any(vec![
                Permission::Allow(Resource::TimeEntries, Operation::DeleteAll),
                Permission::Granted,
            ]),
            action: Operation::DeleteOwn,
            resource: format!("time entry {time_entry_id}"),
        });
    }

    repo.delete(time_entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{bearer_token, create_test_app, create_test_ticket, create_test_user},
    };
    use chrono::SubsecRound;
    use serde_json::json;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_timer_lifecycle(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let other = create_test_ticket(&pool).await;
        let server = create_test_app(pool);

        let running: Option<TimeEntryResponse> = server
            .get("/api/v1/time-entries/timer")
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert!(running.is_none());

        let response = server
            .post(&format!("/api/v1/tickets/{}/timer", ticket.id))
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"note": "  triage  "}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let started: TimeEntryResponse = response.json();
        assert!(started.is_running);
        assert!(started.billable);
        assert_eq!(started.note.as_deref(), Some("triage"));

        server
            .post(&format!("/api/v1/tickets/{}/timer", other.id))
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({}))
            .await
            .assert_status(StatusCode::CONFLICT);

        let stopped: TimeEntryResponse = server
            .post("/api/v1/time-entries/timer/stop")
            .authorization_bearer(bearer_token(&agent))
            .await
            .json();
        assert_eq!(stopped.id, started.id);
        assert!(!stopped.is_running);
        assert_eq!(stopped.duration_minutes, Some(1));

        server
            .post("/api/v1/time-entries/timer/stop")
            .authorization_bearer(bearer_token(&agent))
            .await
            .assert_status_bad_request();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_manual_entries(pool: PgPool) {
        let agent = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);
        let path = format!("/api/v1/tickets/{}/time-entries", ticket.id);
        let started_at = (Utc::now() - Duration::hours(3)).trunc_subsecs(0);

        let entry: TimeEntryResponse = server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"started_at": started_at, "ended_at": started_at + Duration::seconds(61 * 60 + 1)}))
            .await
            .json();
        assert_eq!(entry.duration_minutes, Some(62));

        let entry: TimeEntryResponse = server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"started_at": started_at, "duration_minutes": 45, "billable": false}))
            .await
            .json();
        assert_eq!(entry.ended_at, Some(started_at + Duration::minutes(45)));
        assert!(!entry.billable);

        server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"started_at": started_at}))
            .await
            .assert_status_bad_request();
        server
            .post(&path)
            .authorization_bearer(bearer_token(&agent))
            .json(&json!({"started_at": started_at, "ended_at": started_at - Duration::minutes(1)}))
            .await
            .assert_status_bad_request();

        let entries: Vec<TimeEntryResponse> = server.get(&path).authorization_bearer(bearer_token(&agent)).await.json();
        assert_eq!(entries.len(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_clients_cannot_track_time(pool: PgPool) {
        let client = create_test_user(&pool, Role::User).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);

        server
            .post(&format!("/api/v1/tickets/{}/timer", ticket.id))
            .authorization_bearer(bearer_token(&client))
            .json(&json!({}))
            .await
            .assert_status_forbidden();
        server
            .get(&format!("/api/v1/tickets/{}/time-entries", ticket.id))
            .authorization_bearer(bearer_token(&client))
            .await
            .assert_status_forbidden();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_delete_own_or_as_admin(pool: PgPool) {
        let admin = create_test_user(&pool, Role::Admin).await;
        let agent = create_test_user(&pool, Role::Agent).await;
        let colleague = create_test_user(&pool, Role::Agent).await;
        let ticket = create_test_ticket(&pool).await;
        let server = create_test_app(pool);
        let started_at = Utc::now() - Duration::hours(1);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let entry: TimeEntryResponse = server
                .post(&format!("/api/v1/tickets/{}/time-entries", ticket.id))
                .authorization_bearer(bearer_token(&agent))
                .json(&json!({"started_at": started_at, "duration_minutes": 10}))
                .await
                .json();
            ids.push(entry.id);
        }

        server
            .delete(&format!("/api/v1/time-entries/{}", ids[0]))
            .authorization_bearer(bearer_token(&colleague))
            .await
            .assert_status_forbidden();
        server
            .delete(&format!("/api/v1/time-entries/{}", ids[0]))
            .authorization_bearer(bearer_token(&agent))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&format!("/api/v1/time-entries/{}", ids[1]))
            .authorization_bearer(bearer_token(&admin))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&format!("/api/v1/time-entries/{}", ids[1]))
            .authorization_bearer(bearer_token(&admin))
            .await
            .assert_status_not_found();
    }
}
