//! Database repository for recurring tasks.

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::recurring_tasks::{RecurringTaskCreateDBRequest, RecurringTaskDBResponse, RecurringTaskUpdateDBRequest},
    },
    types::{RecurringTaskId, TicketId, abbrev_uuid},
};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const RECURRING_TASK_COLUMNS: &str = "id, subject, description, requester_id, organization_id, assignee_id, priority_id, \
     ticket_type_id, recurrence, interval_count, starts_at, next_run_at, last_run_at, last_ticket_id, is_active, created_by, \
     created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct RecurringTaskFilter {
    pub skip: i64,
    pub limit: i64,
    pub active_only: bool,
}

pub struct RecurringTasks<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for RecurringTasks<'c> {
    type CreateRequest = RecurringTaskCreateDBRequest;
    type UpdateRequest = RecurringTaskUpdateDBRequest;
    type Response = RecurringTaskDBResponse;
    type Id = RecurringTaskId;
    type Filter = RecurringTaskFilter;

    #[instrument(skip(self, request), fields(subject = %request.subject, recurrence = %request.recurrence), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let task = sqlx::query_as::<_, RecurringTaskDBResponse>(&format!(
            r#"
            INSERT INTO recurring_tasks (
                subject, description, requester_id, organization_id, assignee_id, priority_id, ticket_type_id,
                recurrence, interval_count, starts_at, next_run_at, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, $11)
            RETURNING {RECURRING_TASK_COLUMNS}
            "#
        ))
        .bind(request.subject.trim())
        .bind(&request.description)
        .bind(request.requester_id)
        .bind(request.organization_id)
        .bind(request.assignee_id)
        .bind(request.priority_id)
        .bind(request.ticket_type_id)
        .bind(request.recurrence.as_str())
        .bind(request.interval_count)
        .bind(request.starts_at)
        .bind(request.created_by)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(task)
    }

    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let task = sqlx::query_as::<_, RecurringTaskDBResponse>(&format!("SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(task)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<Self::Id>) -> Result<HashMap<Self::Id, Self::Response>> {
        let tasks =
            sqlx::query_as::<_, RecurringTaskDBResponse>(&format!("SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&mut *self.db)
                .await?;
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks"));
        if filter.active_only {
            builder.push(" WHERE is_active");
        }
        builder.push(" ORDER BY next_run_at, id LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.skip);
        Ok(builder.build_query_as::<RecurringTaskDBResponse>().fetch_all(&mut *self.db).await?)
    }

    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recurring_tasks WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(task_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let task = sqlx::query_as::<_, RecurringTaskDBResponse>(&format!(
            r#"
            UPDATE recurring_tasks SET
                subject = COALESCE($2, subject),
                description = COALESCE($3, description),
                assignee_id = CASE WHEN $4 THEN NULL ELSE COALESCE($5, assignee_id) END,
                priority_id = COALESCE($6, priority_id),
                ticket_type_id = COALESCE($7, ticket_type_id),
                recurrence = COALESCE($8, recurrence),
                interval_count = COALESCE($9, interval_count),
                starts_at = COALESCE($10, starts_at),
                next_run_at = COALESCE($11, next_run_at),
                is_active = COALESCE($12, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RECURRING_TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.subject.as_deref().map(str::trim))
        .bind(&request.description)
        .bind(request.clear_assignee)
        .bind(request.assignee_id)
        .bind(request.priority_id)
        .bind(request.ticket_type_id)
        .bind(request.recurrence.map(|r| r.as_str()))
        .bind(request.interval_count)
        .bind(request.starts_at)
        .bind(request.next_run_at)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(task)
    }
}

impl<'c> RecurringTasks<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &RecurringTaskFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM recurring_tasks");
        if filter.active_only {
            builder.push(" WHERE is_active");
        }
        Ok(builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?)
    }

    /// Lock active tasks that are due. Call inside a transaction; rows locked by another
    /// instance are skipped.
    #[instrument(skip(self), err)]
    pub async fn claim_due(&mut self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RecurringTaskDBResponse>> {
        let tasks = sqlx::query_as::<_, RecurringTaskDBResponse>(&format!(
            r#"
            SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks
            WHERE is_active AND next_run_at <= $1
            ORDER BY next_run_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(tasks)
    }

    /// Record a materialized run and schedule the next one. `next_run_at = None` deactivates
    /// the task (its schedule overflowed).
    #[instrument(skip(self), fields(task_id = %abbrev_uuid(&id)), err)]
    pub async fn record_run(
        &mut self,
        id: RecurringTaskId,
        ran_at: DateTime<Utc>,
        ticket_id: TicketId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recurring_tasks SET
                last_run_at = $2,
                last_ticket_id = $3,
                next_run_at = COALESCE($4, next_run_at),
                is_active = is_active AND $4 IS NOT NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(ran_at)
        .bind(ticket_id)
        .bind(next_run_at)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::recurring_tasks::Recurrence,
        test_utils::{create_test_ticket, create_test_user},
    };
    use chrono::Duration;
    use sqlx::PgPool;

    fn request(requester_id: uuid::Uuid, starts_at: DateTime<Utc>) -> RecurringTaskCreateDBRequest {
        RecurringTaskCreateDBRequest {
            subject: "Check backups".to_string(),
            description: "Verify last night's backup completed".to_string(),
            requester_id,
            organization_id: None,
            assignee_id: None,
            priority_id: None,
            ticket_type_id: None,
            recurrence: Recurrence::Weekly,
            interval_count: 1,
            starts_at,
            created_by: None,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_claim_due_skips_future_and_inactive(pool: PgPool) {
        let requester = create_test_user(&pool, Role::User).await;
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = RecurringTasks::new(&mut conn);
        let due = repo.create(&request(requester.id, now - Duration::hours(1))).await.unwrap();
        assert_eq!(due.next_run_at, due.starts_at);
        repo.create(&request(requester.id, now + Duration::hours(1))).await.unwrap();
        let paused = repo.create(&request(requester.id, now - Duration::hours(2))).await.unwrap();
        repo.update(
            paused.id,
            &RecurringTaskUpdateDBRequest {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let claimed = repo.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].recurrence, Recurrence::Weekly);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_claimed_rows_are_skipped_by_other_transactions(pool: PgPool) {
        let requester = create_test_user(&pool, Role::User).await;
        let now = Utc::now();
        {
            let mut conn = pool.acquire().await.unwrap();
            RecurringTasks::new(&mut conn)
                .create(&request(requester.id, now - Duration::minutes(5)))
                .await
                .unwrap();
        }

        let mut first = pool.begin().await.unwrap();
        assert_eq!(RecurringTasks::new(&mut *first).claim_due(now, 10).await.unwrap().len(), 1);

        let mut second = pool.begin().await.unwrap();
        assert!(RecurringTasks::new(&mut *second).claim_due(now, 10).await.unwrap().is_empty());

        first.rollback().await.unwrap();
        second.rollback().await.unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_record_run(pool: PgPool) {
        let ticket = create_test_ticket(&pool).await;
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = RecurringTasks::new(&mut conn);
        let task = repo.create(&request(ticket.requester_id, now)).await.unwrap();

        let next = now + Duration::weeks(1);
        repo.record_run(task.id, now, ticket.id, Some(next)).await.unwrap();
        let after = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(after.last_ticket_id, Some(ticket.id));
        assert!(after.is_active);
        assert!(after.next_run_at > now);

        repo.record_run(task.id, now, ticket.id, None).await.unwrap();
        assert!(!repo.get_by_id(task.id).await.unwrap().unwrap().is_active);
    }
}
