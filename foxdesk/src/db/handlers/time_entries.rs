//! Database repository for time entries.
//!
//! A user has at most one running timer, enforced by the `time_entries_running_per_user`
//! partial unique index. Starting a second timer surfaces as a unique violation on it.

use crate::{
    db::{
        errors::{DbError, Result},
        models::time_entries::{TimeEntryCreateDBRequest, TimeEntryDBResponse},
    },
    types::{TicketId, TimeEntryId, UserId, abbrev_uuid},
};
use sqlx::PgConnection;
use tracing::instrument;

pub const RUNNING_TIMER_CONSTRAINT: &str = "time_entries_running_per_user";

const TIME_ENTRY_SELECT: &str = r#"
    SELECT e.id, e.ticket_id, e.user_id, u.email AS user_email, e.started_at, e.ended_at,
           e.duration_minutes, e.billable, e.note, e.created_at
    FROM time_entries e
    JOIN users u ON u.id = e.user_id
"#;

pub struct TimeEntries<'c> {
    db: &'c mut PgConnection,
}

impl<'c> TimeEntries<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(ticket_id = %abbrev_uuid(&request.ticket_id), user_id = %abbrev_uuid(&request.user_id)), err)]
    pub async fn create(&mut self, request: &TimeEntryCreateDBRequest) -> Result<TimeEntryDBResponse> {
        let id: TimeEntryId = sqlx::query_scalar(
            r#"
            INSERT INTO time_entries (ticket_id, user_id, started_at, ended_at, duration_minutes, billable, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(request.ticket_id)
        .bind(request.user_id)
        .bind(request.started_at)
        .bind(request.ended_at)
        .bind(request.duration_minutes)
        .bind(request.billable)
        .bind(&request.note)
        .fetch_one(&mut *self.db)
        .await?;

        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(time_entry_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: TimeEntryId) -> Result<Option<TimeEntryDBResponse>> {
        let entry = sqlx::query_as::<_, TimeEntryDBResponse>(&format!("{TIME_ENTRY_SELECT} WHERE e.id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(entry)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn running_for_user(&mut self, user_id: UserId) -> Result<Option<TimeEntryDBResponse>> {
        let entry = sqlx::query_as::<_, TimeEntryDBResponse>(&format!("{TIME_ENTRY_SELECT} WHERE e.user_id = $1 AND e.ended_at IS NULL"))
            .bind(user_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(entry)
    }

    /// Stop the user's running timer, rounding its duration up to whole minutes.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn stop_running(&mut self, user_id: UserId) -> Result<Option<TimeEntryDBResponse>> {
        let id: Option<TimeEntryId> = sqlx::query_scalar(
            r#"
            UPDATE time_entries SET
                ended_at = GREATEST(NOW(), started_at),
                duration_minutes = GREATEST(1, CEIL(EXTRACT(EPOCH FROM (GREATEST(NOW(), started_at) - started_at)) / 60))::INTEGER
            WHERE user_id = $1 AND ended_at IS NULL
            RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.db)
        .await?;

        match id {
            Some(id) => self.get_by_id(id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(ticket_id = %abbrev_uuid(&ticket_id)), err)]
    pub async fn list_for_ticket(&mut self, ticket_id: TicketId) -> Result<Vec<TimeEntryDBResponse>> {
        let entries = sqlx::query_as::<_, TimeEntryDBResponse>(&format!(
            "{TIME_ENTRY_SELECT} WHERE e.ticket_id = $1 ORDER BY e.started_at, e.id"
        ))
        .bind(ticket_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(entries)
    }

    #[instrument(skip(self), fields(time_entry_id = %abbrev_uuid(&id)), err)]
    pub async fn delete(&mut self, id: TimeEntryId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM time_entries WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }
}
