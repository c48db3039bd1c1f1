//! Database access for email ingestion bookkeeping.

use crate::{
    db::{
        errors::Result,
        models::ingest::{IngestLogCreateDBRequest, IngestLogDBResponse, IngestOutcome, IngestRunDBResponse, RunCounters},
    },
    types::{IngestRunId, abbrev_uuid},
};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

const RUN_COLUMNS: &str =
    "id, mailbox, trigger, started_at, finished_at, fetched, created_tickets, appended_comments, duplicates, rejected, failed, error";
const LOG_COLUMNS: &str =
    "id, run_id, mailbox, uid, message_id, from_address, subject, outcome, ticket_id, comment_id, detail, created_at";

pub struct IngestRuns<'c> {
    db: &'c mut PgConnection,
}

impl<'c> IngestRuns<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn start(&mut self, mailbox: &str, trigger: &str) -> Result<IngestRunDBResponse> {
        let run = sqlx::query_as::<_, IngestRunDBResponse>(&format!(
            "INSERT INTO email_ingest_runs (mailbox, trigger) VALUES ($1, $2) RETURNING {RUN_COLUMNS}"
        ))
        .bind(mailbox)
        .bind(trigger)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(run)
    }

    #[instrument(skip(self, counters), fields(run_id = %abbrev_uuid(&id)), err)]
    pub async fn finish(&mut self, id: IngestRunId, counters: &RunCounters, error: Option<&str>) -> Result<IngestRunDBResponse> {
        let run = sqlx::query_as::<_, IngestRunDBResponse>(&format!(
            r#"
            UPDATE email_ingest_runs SET
                finished_at = NOW(),
                fetched = $2,
                created_tickets = $3,
                appended_comments = $4,
                duplicates = $5,
                rejected = $6,
                failed = $7,
                error = $8
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(counters.fetched)
        .bind(counters.created_tickets)
        .bind(counters.appended_comments)
        .bind(counters.duplicates)
        .bind(counters.rejected)
        .bind(counters.failed)
        .bind(error)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: IngestRunId) -> Result<Option<IngestRunDBResponse>> {
        let run = sqlx::query_as::<_, IngestRunDBResponse>(&format!("SELECT {RUN_COLUMNS} FROM email_ingest_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(run)
    }

    #[instrument(skip(self), err)]
    pub async fn list(&mut self, skip: i64, limit: i64) -> Result<Vec<IngestRunDBResponse>> {
        let runs = sqlx::query_as::<_, IngestRunDBResponse>(&format!(
            "SELECT {RUN_COLUMNS} FROM email_ingest_runs ORDER BY started_at DESC, id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(runs)
    }

    #[instrument(skip(self), err)]
    pub async fn count(&mut self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM email_ingest_runs").fetch_one(&mut *self.db).await?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestLogFilter {
    pub skip: i64,
    pub limit: i64,
    pub run_id: Option<IngestRunId>,
    pub outcome: Option<IngestOutcome>,
}

fn push_log_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &IngestLogFilter) {
    builder.push(" WHERE 1=1");
    if let Some(run_id) = filter.run_id {
        builder.push(" AND run_id = ");
        builder.push_bind(run_id);
    }
    if let Some(outcome) = filter.outcome {
        builder.push(" AND outcome = ");
        builder.push_bind(outcome.as_str());
    }
}

pub struct IngestLogs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> IngestLogs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(message_id = %request.message_id, outcome = %request.outcome), err)]
    pub async fn create(&mut self, request: &IngestLogCreateDBRequest) -> Result<IngestLogDBResponse> {
        let log = sqlx::query_as::<_, IngestLogDBResponse>(&format!(
            r#"
            INSERT INTO email_ingest_logs (run_id, mailbox, uid, message_id, from_address, subject, outcome, ticket_id, comment_id, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(request.run_id)
        .bind(&request.mailbox)
        .bind(request.uid)
        .bind(&request.message_id)
        .bind(&request.from_address)
        .bind(&request.subject)
        .bind(request.outcome.as_str())
        .bind(request.ticket_id)
        .bind(request.comment_id)
        .bind(&request.detail)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(log)
    }

    /// Whether a Message-ID already produced a ticket or comment.
    #[instrument(skip(self), err)]
    pub async fn is_ingested(&mut self, message_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM email_ingest_logs WHERE message_id = $1 AND outcome IN ('created_ticket', 'appended_comment'))",
        )
        .bind(message_id)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(exists)
    }

    /// How many times ingesting this message has failed so far.
    #[instrument(skip(self), err)]
    pub async fn failure_count(&mut self, message_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM email_ingest_logs WHERE message_id = $1 AND outcome = 'failed'")
            .bind(message_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &IngestLogFilter) -> Result<Vec<IngestLogDBResponse>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {LOG_COLUMNS} FROM email_ingest_logs"));
        push_log_filters(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id LIMIT ");
        builder.push_bind(filter.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.skip);
        Ok(builder.build_query_as::<IngestLogDBResponse>().fetch_all(&mut *self.db).await?)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &IngestLogFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM email_ingest_logs");
        push_log_filters(&mut builder, filter);
        Ok(builder.build_query_scalar::<i64>().fetch_one(&mut *self.db).await?)
    }
}
