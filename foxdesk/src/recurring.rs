//! Turns due recurring tasks into tickets.
//!
//! Runs on the leader only. Each task is claimed and materialized in its own transaction with
//! `FOR UPDATE SKIP LOCKED`, so a second instance that slips through during a leadership handover
//! skips rows that are already being handled instead of creating duplicates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    db::{
        errors::Result,
        handlers::{RecurringTasks, Repository, TicketDefaults, Tickets, Users},
        models::{
            recurring_tasks::{RecurringTaskDBResponse, next_occurrence},
            tickets::{TicketCreateDBRequest, TicketDBResponse, TicketSource},
        },
    },
    notifications::Notifier,
    types::abbrev_uuid,
};

/// Upper bound on tasks materialized per tick.
const MAX_TASKS_PER_TICK: usize = 100;

#[derive(Clone)]
pub struct RecurringScheduler {
    pool: PgPool,
    notifier: Notifier,
}

impl RecurringScheduler {
    pub fn new(pool: PgPool, notifier: Notifier) -> Self {
        Self { pool, notifier }
    }

    /// Create tickets for every task due at `now`. Returns how many were created.
    #[instrument(skip(self), err)]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;
        while created < MAX_TASKS_PER_TICK {
            let mut tx = self.pool.begin().await?;
            let Some(task) = RecurringTasks::new(&mut tx).claim_due(now, 1).await?.pop() else {
                break;
            };

            let ticket = materialize(&mut tx, &task).await?;
            let next_run_at = next_occurrence(task.recurrence, task.interval(), task.starts_at, now);
            RecurringTasks::new(&mut tx).record_run(task.id, now, ticket.id, next_run_at).await?;
            tx.commit().await?;

            match next_run_at {
                Some(next) => info!(
                    task_id = %abbrev_uuid(&task.id),
                    ticket_id = %abbrev_uuid(&ticket.id),
                    next_run_at = %next,
                    "Recurring task created ticket"
                ),
                None => warn!(task_id = %abbrev_uuid(&task.id), "Recurring task schedule ended, task deactivated"),
            }
            metrics::counter!("foxdesk_recurring_tickets_created_total").increment(1);

            self.notifier.ticket_created(ticket.id);
            if ticket.assignee_id.is_some() {
                self.notifier.ticket_assigned(ticket.id);
            }
            created += 1;
        }
        Ok(created)
    }

    /// Poll for due tasks until `shutdown` is cancelled.
    pub async fn run(self, poll_interval: Duration, shutdown: CancellationToken) {
        info!(interval = ?poll_interval, "Recurring task scheduler started");
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_due(Utc::now()).await {
                Ok(0) => debug!("No recurring tasks due"),
                Ok(created) => info!(created, "Materialized recurring tasks"),
                Err(e) => error!(error = %e, "Recurring task run failed"),
            }
        }

        info!("Recurring task scheduler stopped");
    }
}

async fn materialize(conn: &mut sqlx::PgConnection, task: &RecurringTaskDBResponse) -> Result<TicketDBResponse> {
    let defaults = TicketDefaults::load(&mut *conn).await?;
    let organization_id = match task.organization_id {
        Some(id) => Some(id),
        None => Users::new(&mut *conn)
            .get_by_id(task.requester_id)
            .await?
            .and_then(|requester| requester.organization_id),
    };

    Tickets::new(&mut *conn)
        .create(&TicketCreateDBRequest {
            subject: task.subject.clone(),
            description: task.description.clone(),
            requester_id: task.requester_id,
            organization_id,
            assignee_id: task.assignee_id,
            status_id: defaults.status_id,
            priority_id: task.priority_id.unwrap_or(defaults.priority_id),
            ticket_type_id: task.ticket_type_id.unwrap_or(defaults.ticket_type_id),
            source: TicketSource::Recurring,
            message_id: None,
            due_at: None,
        })
        .await
}
