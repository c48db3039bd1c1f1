//! A single ingest run.
//!
//! Runs are serialized across instances with a PostgreSQL advisory lock. Every message gets its
//! own transaction: the ticket or comment, its attachments and the ingest log row commit
//! together. If anything fails the transaction rolls back, files written for the message are
//! removed again, and a `failed` log row is written outside the transaction.

use std::sync::Arc;

use sqlx::{Connection, PgConnection, PgPool, Postgres, pool::PoolConnection};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::{
    IngestError,
    classify::{OwnIdentity, find_ticket, may_reply, rejection_reason},
    mailbox::{MailSource, MailSourceConnector},
    message::{InboundMessage, synthetic_message_id},
    text::strip_quoted_reply,
};
use crate::{
    api::models::users::Role,
    config::{Config, IngestConfig},
    db::{
        handlers::{Attachments, Comments, IngestLogs, IngestRuns, Organizations, Repository, Settings, TicketDefaults, Tickets, Users},
        models::{
            attachments::AttachmentCreateDBRequest,
            comments::CommentCreateDBRequest,
            ingest::{IngestLogCreateDBRequest, IngestOutcome, IngestRunDBResponse, RunCounters},
            tickets::{TicketCreateDBRequest, TicketDBResponse, TicketSource},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    email::message_id_domain,
    notifications::Notifier,
    storage::{LocalFileStorage, sanitize_filename},
    types::{CommentId, IngestRunId, TicketId, UserId, abbrev_uuid},
};

/// Advisory lock key for ingest runs ("FOXDMAIL").
pub const INGEST_LOCK_ID: i64 = 0x464F_5844_4D41_494C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

/// What a successfully written message produced, for notifications after commit.
#[derive(Debug, Clone, Copy)]
enum Written {
    Ticket(TicketId),
    Comment { ticket_id: TicketId, comment_id: CommentId },
}

struct Processed {
    outcome: IngestOutcome,
    message_id: String,
    written: Option<Written>,
}

impl Processed {
    fn outcome(outcome: IngestOutcome, message_id: &str) -> Self {
        Self {
            outcome,
            message_id: message_id.to_string(),
            written: None,
        }
    }
}

/// The session-scoped ingest lock. Dropped without [`IngestLock::release`], as when a run is
/// cancelled mid-way, the connection is closed instead of going back to the pool with the
/// lock still held.
struct IngestLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl IngestLock {
    async fn try_acquire(pool: &PgPool) -> Result<Option<Self>, IngestError> {
        let mut conn = pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(INGEST_LOCK_ID)
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked.then_some(Self { conn: Some(conn) }))
    }

    async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(INGEST_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!(error = %e, "Failed to release ingest lock, closing its connection");
            let _ = conn.detach().close().await;
        }
    }
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!("Ingest run interrupted, closing the lock connection");
        let conn = conn.detach();
        // Without a runtime the socket is dropped, which ends the session all the same.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    warn!(error = %e, "Failed to close ingest lock connection");
                }
            });
        }
    }
}

const INTERRUPTED_RUN_ERROR: &str = "run interrupted before it finished";

/// A run row that has been opened. If the run is dropped before [`OpenRun::finish`], the row
/// is closed in the background with the counters so far and an error.
struct OpenRun {
    pool: PgPool,
    id: IngestRunId,
    counters: RunCounters,
    finished: bool,
}

impl OpenRun {
    async fn finish(mut self, error: Option<&str>) -> Result<IngestRunDBResponse, IngestError> {
        let mut conn = self.pool.acquire().await?;
        let run = IngestRuns::new(&mut conn).finish(self.id, &self.counters, error).await?;
        self.finished = true;
        Ok(run)
    }
}

impl Drop for OpenRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let (pool, id, counters) = (self.pool.clone(), self.id, self.counters);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let result = match pool.acquire().await {
                    Ok(mut conn) => IngestRuns::new(&mut conn)
                        .finish(id, &counters, Some(INTERRUPTED_RUN_ERROR))
                        .await
                        .map(|_| ())
                        .map_err(IngestError::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    error!(run_id = %abbrev_uuid(&id), error = %e, "Failed to close interrupted ingest run");
                }
            });
        }
    }
}

/// Where a message came from, stamped onto its log row.
struct Delivery<'a> {
    run_id: IngestRunId,
    mailbox: &'a str,
    uid: u32,
}

impl Delivery<'_> {
    fn log(&self, message: &InboundMessage, outcome: IngestOutcome) -> IngestLogCreateDBRequest {
        IngestLogCreateDBRequest {
            run_id: Some(self.run_id),
            mailbox: self.mailbox.to_string(),
            uid: Some(i64::from(self.uid)),
            message_id: message.message_id.clone(),
            from_address: message.from_email.clone(),
            subject: Some(message.subject.clone()).filter(|s| !s.is_empty()),
            outcome,
            ticket_id: None,
            comment_id: None,
            detail: None,
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    pool: PgPool,
    config: IngestConfig,
    own: OwnIdentity,
    storage: LocalFileStorage,
    notifier: Notifier,
    connector: Arc<dyn MailSourceConnector>,
}

impl IngestPipeline {
    pub fn new(pool: PgPool, config: &Config, storage: LocalFileStorage, notifier: Notifier, connector: Arc<dyn MailSourceConnector>) -> Self {
        Self {
            pool,
            config: config.ingest.clone(),
            own: OwnIdentity {
                address: config.helpdesk_address().to_lowercase(),
                message_id_domain: message_id_domain(&config.email.from_email),
            },
            storage,
            notifier,
            connector,
        }
    }

    /// Run once. Returns `None` without doing anything when another run holds the lock.
    ///
    /// Mailbox problems (connection refused, a dropped session) end the run early and are
    /// recorded on the run row; only database failures around the run itself are returned.
    pub async fn run(&self, trigger: RunTrigger) -> Result<Option<IngestRunDBResponse>, IngestError> {
        let Some(lock) = IngestLock::try_acquire(&self.pool).await? else {
            info!("Another ingest run holds the lock, skipping");
            return Ok(None);
        };

        let result = self
            .run_locked(trigger)
            .instrument(info_span!("ingest_run", trigger = trigger.as_str()))
            .await;
        lock.release().await;

        result.map(Some)
    }

    async fn run_locked(&self, trigger: RunTrigger) -> Result<IngestRunDBResponse, IngestError> {
        let run = {
            let mut conn = self.pool.acquire().await?;
            IngestRuns::new(&mut conn).start(&self.config.imap.mailbox, trigger.as_str()).await?
        };
        let mut open = OpenRun {
            pool: self.pool.clone(),
            id: run.id,
            counters: RunCounters::default(),
            finished: false,
        };

        let error = match self.process_mailbox(run.id, &mut open.counters).await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Ingest run aborted");
                Some(e.to_string())
            }
        };

        let counters = open.counters;
        let run = open.finish(error.as_deref()).await?;
        info!(
            run_id = %abbrev_uuid(&run.id),
            fetched = counters.fetched,
            created = counters.created_tickets,
            appended = counters.appended_comments,
            duplicates = counters.duplicates,
            rejected = counters.rejected,
            failed = counters.failed,
            "Ingest run finished"
        );
        Ok(run)
    }

    async fn process_mailbox(&self, run_id: IngestRunId, counters: &mut RunCounters) -> Result<(), IngestError> {
        let mut source = self.connector.connect().await?;
        let result = self.drain(source.as_mut(), run_id, counters).await;
        if let Err(e) = source.close().await {
            warn!(error = %e, "Failed to close mailbox");
        }
        result
    }

    async fn drain(&self, source: &mut dyn MailSource, run_id: IngestRunId, counters: &mut RunCounters) -> Result<(), IngestError> {
        let mailbox = source.mailbox().to_string();
        let uids = source.list_uids(self.config.max_messages_per_run).await?;
        info!(count = uids.len(), mailbox = %mailbox, "Messages waiting");

        for uid in uids {
            let raw = match source.fetch(uid).await {
                Ok(raw) => raw,
                Err(IngestError::MissingMessage { uid }) => {
                    warn!(uid, "Message disappeared before it could be fetched");
                    continue;
                }
                Err(e) => return Err(e),
            };
            counters.fetched += 1;

            let delivery = Delivery {
                run_id,
                mailbox: &mailbox,
                uid,
            };
            let processed = self.process_message(&delivery, &raw).await;
            counters.record(processed.outcome);
            metrics::counter!("foxdesk_ingest_messages_total", "outcome" => processed.outcome.as_str()).increment(1);

            let marked = if processed.outcome.is_processed() {
                source.mark_processed(uid).await
            } else {
                let final_attempt = self.attempts_exhausted(&processed.message_id).await;
                source.mark_failed(uid, final_attempt).await
            };
            if let Err(e) = marked {
                warn!(uid, error = %e, "Failed to update mailbox state");
            }

            self.notify(processed.written);
        }
        Ok(())
    }

    /// Whether a failing message has used up its attempts and should stop being retried.
    async fn attempts_exhausted(&self, message_id: &str) -> bool {
        let failures = match self.pool.acquire().await {
            Ok(mut conn) => IngestLogs::new(&mut conn).failure_count(message_id).await.map_err(IngestError::from),
            Err(e) => Err(e.into()),
        };
        match failures {
            Ok(count) => count >= i64::from(self.config.max_attempts),
            Err(e) => {
                warn!(message_id, error = %e, "Failed to count earlier attempts");
                false
            }
        }
    }

    async fn process_message(&self, delivery: &Delivery<'_>, raw: &[u8]) -> Processed {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(uid = delivery.uid, error = %e, "Unparseable message");
                let message_id = synthetic_message_id(raw);
                let log = IngestLogCreateDBRequest {
                    run_id: Some(delivery.run_id),
                    mailbox: delivery.mailbox.to_string(),
                    uid: Some(i64::from(delivery.uid)),
                    message_id: message_id.clone(),
                    from_address: None,
                    subject: None,
                    outcome: IngestOutcome::Failed,
                    ticket_id: None,
                    comment_id: None,
                    detail: Some(e.to_string()),
                };
                self.write_failure_log(&log).await;
                return Processed::outcome(IngestOutcome::Failed, &message_id);
            }
        };

        let span = info_span!("ingest_message", uid = delivery.uid, message_id = %message.message_id);
        let mut stored = Vec::new();
        match self.ingest(delivery, &message, &mut stored).instrument(span).await {
            Ok(processed) => processed,
            Err(e) => {
                warn!(uid = delivery.uid, message_id = %message.message_id, error = %e, "Failed to ingest message");
                for path in &stored {
                    if let Err(e) = self.storage.delete(path).await {
                        warn!(path = %path, error = %e, "Failed to remove attachment after rollback");
                    }
                }
                let log = IngestLogCreateDBRequest {
                    detail: Some(e.to_string()),
                    ..delivery.log(&message, IngestOutcome::Failed)
                };
                self.write_failure_log(&log).await;
                Processed::outcome(IngestOutcome::Failed, &message.message_id)
            }
        }
    }

    async fn write_failure_log(&self, log: &IngestLogCreateDBRequest) {
        let result = match self.pool.acquire().await {
            Ok(mut conn) => IngestLogs::new(&mut conn).create(log).await.map(|_| ()).map_err(IngestError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to record ingest failure");
        }
    }

    /// Everything for one message, in one transaction. `stored` collects the attachment files
    /// written so the caller can remove them if the transaction does not commit.
    async fn ingest(&self, delivery: &Delivery<'_>, message: &InboundMessage, stored: &mut Vec<String>) -> Result<Processed, IngestError> {
        let mut tx = self.pool.begin().await?;

        if IngestLogs::new(&mut tx).is_ingested(&message.message_id).await? {
            info!("Message already ingested");
            IngestLogs::new(&mut tx).create(&delivery.log(message, IngestOutcome::Duplicate)).await?;
            tx.commit().await?;
            return Ok(Processed::outcome(IngestOutcome::Duplicate, &message.message_id));
        }

        let sender = match rejection_reason(message, &self.config, &self.own) {
            Some(reason) => Err(reason),
            None => self.resolve_sender(&mut tx, message).await?,
        };
        let sender = match sender {
            Ok(sender) => sender,
            Err(reason) => {
                info!(reason = %reason, "Message rejected");
                let log = IngestLogCreateDBRequest {
                    detail: Some(reason),
                    ..delivery.log(message, IngestOutcome::Rejected)
                };
                IngestLogs::new(&mut tx).create(&log).await?;
                tx.commit().await?;
                return Ok(Processed::outcome(IngestOutcome::Rejected, &message.message_id));
            }
        };

        let settings = Settings::new(&mut tx).load().await?;
        let mut notes = Vec::new();
        if message.synthetic_message_id {
            notes.push("no Message-ID header, identified by content hash".to_string());
        }
        let written = match find_ticket(&mut tx, message, &settings.ticket_reference_prefix, &self.own.message_id_domain).await? {
            Some(ticket) if may_reply(&ticket, &sender) => self.append_comment(&mut tx, &ticket, &sender, message, stored, &mut notes).await?,
            Some(ticket) => {
                notes.push(format!(
                    "{} is not a participant of {}, opened a new ticket",
                    sender.email,
                    settings.reference_token(ticket.reference)
                ));
                self.create_ticket(&mut tx, &sender, message, stored, &mut notes).await?
            }
            None => self.create_ticket(&mut tx, &sender, message, stored, &mut notes).await?,
        };

        let (outcome, ticket_id, comment_id) = match written {
            Written::Ticket(ticket_id) => (IngestOutcome::CreatedTicket, ticket_id, None),
            Written::Comment { ticket_id, comment_id } => (IngestOutcome::AppendedComment, ticket_id, Some(comment_id)),
        };
        let log = IngestLogCreateDBRequest {
            ticket_id: Some(ticket_id),
            comment_id,
            detail: (!notes.is_empty()).then(|| notes.join("; ")),
            ..delivery.log(message, outcome)
        };
        IngestLogs::new(&mut tx).create(&log).await?;
        tx.commit().await?;

        info!(outcome = %outcome, ticket_id = %abbrev_uuid(&ticket_id), "Message ingested");
        Ok(Processed {
            outcome,
            message_id: message.message_id.clone(),
            written: Some(written),
        })
    }

    /// The sending user, created on the fly for unknown addresses when allowed. The inner
    /// `Err` is a rejection reason.
    async fn resolve_sender(&self, conn: &mut PgConnection, message: &InboundMessage) -> Result<Result<UserDBResponse, String>, IngestError> {
        let Some(email) = message.from_email.as_deref() else {
            return Ok(Err("message has no sender address".to_string()));
        };

        if let Some(user) = Users::new(&mut *conn).get_user_by_email(email).await? {
            if !user.is_active {
                return Ok(Err(format!("sender {email} has a deactivated account")));
            }
            return Ok(Ok(user));
        }

        if !self.config.auto_create_users {
            return Ok(Err(format!("sender {email} has no account")));
        }

        let organization = match email.rsplit_once('@') {
            Some((_, domain)) => Organizations::new(&mut *conn).find_by_email_domain(domain).await?,
            None => None,
        };
        let user = Users::new(&mut *conn)
            .create(&UserCreateDBRequest {
                email: email.to_string(),
                display_name: message.from_name.clone(),
                role: Role::User,
                organization_id: organization.map(|o| o.id),
                password_hash: None,
                notify_by_email: true,
                auth_source: "email".to_string(),
            })
            .await?;
        info!(user_id = %abbrev_uuid(&user.id), "Created account for new sender");
        Ok(Ok(user))
    }

    async fn create_ticket(
        &self,
        conn: &mut PgConnection,
        sender: &UserDBResponse,
        message: &InboundMessage,
        stored: &mut Vec<String>,
        notes: &mut Vec<String>,
    ) -> Result<Written, IngestError> {
        let defaults = TicketDefaults::load(&mut *conn).await?;
        let subject = if message.subject.is_empty() {
            "(no subject)".to_string()
        } else {
            message.subject.clone()
        };

        let ticket = Tickets::new(&mut *conn)
            .create(&TicketCreateDBRequest {
                subject,
                description: message.body.clone(),
                requester_id: sender.id,
                organization_id: sender.organization_id,
                assignee_id: None,
                status_id: defaults.status_id,
                priority_id: defaults.priority_id,
                ticket_type_id: defaults.ticket_type_id,
                source: TicketSource::Email,
                message_id: Some(message.message_id.clone()),
                due_at: None,
            })
            .await?;

        self.store_attachments(conn, ticket.id, None, sender.id, message, stored, notes).await?;
        Ok(Written::Ticket(ticket.id))
    }

    async fn append_comment(
        &self,
        conn: &mut PgConnection,
        ticket: &TicketDBResponse,
        sender: &UserDBResponse,
        message: &InboundMessage,
        stored: &mut Vec<String>,
        notes: &mut Vec<String>,
    ) -> Result<Written, IngestError> {
        let body = if self.config.strip_quoted_replies {
            strip_quoted_reply(&message.body)
        } else {
            message.body.clone()
        };

        let comment = Comments::new(&mut *conn)
            .create(&CommentCreateDBRequest {
                ticket_id: ticket.id,
                author_id: Some(sender.id),
                author_email: sender.email.clone(),
                body,
                is_internal: false,
                source: TicketSource::Email,
                message_id: Some(message.message_id.clone()),
            })
            .await?;

        if self.config.reopen_closed_on_reply && ticket.is_closed && !sender.role.is_staff() {
            let open_status = TicketDefaults::load(&mut *conn).await?.status_id;
            if Tickets::new(&mut *conn).reopen(ticket.id, open_status).await? {
                notes.push("reopened closed ticket".to_string());
            }
        }

        self.store_attachments(conn, ticket.id, Some(comment.id), sender.id, message, stored, notes)
            .await?;
        Ok(Written::Comment {
            ticket_id: ticket.id,
            comment_id: comment.id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_attachments(
        &self,
        conn: &mut PgConnection,
        ticket_id: TicketId,
        comment_id: Option<CommentId>,
        uploader: UserId,
        message: &InboundMessage,
        stored: &mut Vec<String>,
        notes: &mut Vec<String>,
    ) -> Result<(), IngestError> {
        for attachment in &message.attachments {
            let filename = sanitize_filename(&attachment.filename);
            if let Err(rejection) = self.storage.check(&filename, attachment.content.len() as u64) {
                info!(filename = %filename, reason = %rejection, "Skipping attachment");
                notes.push(format!("skipped attachment {filename}: {rejection}"));
                continue;
            }

            let id = Uuid::new_v4();
            let file = self.storage.store(ticket_id, id, &attachment.content).await?;
            stored.push(file.storage_path.clone());
            Attachments::new(&mut *conn)
                .create(&AttachmentCreateDBRequest {
                    id,
                    ticket_id,
                    comment_id,
                    uploaded_by: Some(uploader),
                    filename,
                    content_type: attachment.content_type.clone(),
                    size_bytes: file.size_bytes,
                    sha256: file.sha256,
                    storage_path: file.storage_path,
                })
                .await?;
        }
        Ok(())
    }

    fn notify(&self, written: Option<Written>) {
        match written {
            Some(Written::Ticket(ticket_id)) => {
                self.notifier.ticket_created(ticket_id);
            }
            Some(Written::Comment { ticket_id, comment_id }) => {
                self.notifier.comment_added(ticket_id, comment_id);
            }
            None => {}
        }
    }
}
