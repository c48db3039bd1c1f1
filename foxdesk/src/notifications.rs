//! Ticket notification mail.
//!
//! Each notification is built and sent on its own spawned task so request handlers and the
//! ingest pipeline never wait on SMTP. Failures are logged and otherwise ignored. The returned
//! `JoinHandle` is only awaited by tests.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    config::{Config, NotificationsConfig},
    db::{
        handlers::{Comments, Repository, Settings, Tickets, Users},
        models::{settings::SystemSettings, tickets::TicketDBResponse, users::UserDBResponse},
    },
    email::{EmailService, OutgoingEmail},
    errors::Error,
    types::{CommentId, TicketId, abbrev_uuid},
};

#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
    email: Option<Arc<EmailService>>,
    config: NotificationsConfig,
    public_url: String,
}

impl Notifier {
    /// Build a notifier. If the mail transport cannot be set up, notifications are disabled
    /// with a warning rather than failing startup.
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let email = match EmailService::new(config) {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                warn!(error = %e, "Failed to create email service, notifications disabled");
                None
            }
        };
        Self {
            pool,
            email,
            config: config.notifications.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        }
    }

    fn ticket_url(&self, ticket_id: TicketId) -> Option<String> {
        (!self.public_url.is_empty()).then(|| format!("{}/tickets/{ticket_id}", self.public_url))
    }

    fn spawn<F>(&self, what: &'static str, ticket_id: TicketId, task: F) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        if !self.config.enabled || self.email.is_none() {
            return None;
        }
        let span = info_span!("notification", kind = what, ticket_id = %abbrev_uuid(&ticket_id));
        Some(tokio::spawn(
            async move {
                if let Err(e) = task.await {
                    warn!(error = %e, "Failed to send notification");
                }
            }
            .instrument(span),
        ))
    }

    /// Acknowledge a new ticket to its requester.
    pub fn ticket_created(&self, ticket_id: TicketId) -> Option<JoinHandle<()>> {
        let this = self.clone();
        self.spawn("ticket_created", ticket_id, async move { this.send_ticket_created(ticket_id).await })
    }

    /// Tell an assignee a ticket is theirs.
    pub fn ticket_assigned(&self, ticket_id: TicketId) -> Option<JoinHandle<()>> {
        if !self.config.notify_assignee {
            return None;
        }
        let this = self.clone();
        self.spawn("ticket_assigned", ticket_id, async move { this.send_ticket_assigned(ticket_id).await })
    }

    /// Staff replies go to the requester; everything else goes to the assignee.
    pub fn comment_added(&self, ticket_id: TicketId, comment_id: CommentId) -> Option<JoinHandle<()>> {
        let this = self.clone();
        self.spawn("comment_added", ticket_id, async move {
            this.send_comment_added(ticket_id, comment_id).await
        })
    }

    /// Password reset mail is sent even when ticket notifications are switched off.
    pub fn password_reset(&self, user: UserDBResponse, reset_link: String, valid_for: Duration) -> Option<JoinHandle<()>> {
        let email = self.email.clone()?;
        let pool = self.pool.clone();
        Some(tokio::spawn(
            async move {
                let result: Result<(), Error> = async {
                    let mut conn = pool.acquire().await.map_err(|e| Error::Database(e.into()))?;
                    let settings = Settings::new(&mut conn).load().await?;
                    let body = email.render_password_reset(user.name(), &settings.helpdesk_name, &reset_link, valid_for.as_secs() / 60)?;
                    email
                        .send(OutgoingEmail {
                            to_email: user.email.clone(),
                            to_name: user.display_name.clone(),
                            subject: format!("{} password reset", settings.helpdesk_name),
                            body,
                            message_id: None,
                            in_reply_to: None,
                            references: Vec::new(),
                        })
                        .await
                }
                .await;
                if let Err(e) = result {
                    warn!(error = %e, "Failed to send password reset email");
                }
            }
            .instrument(info_span!("password_reset_email")),
        ))
    }

    async fn load_ticket(&self, ticket_id: TicketId) -> Result<(TicketDBResponse, SystemSettings), Error> {
        let mut conn = self.pool.acquire().await.map_err(|e| Error::Database(e.into()))?;
        let ticket = Tickets::new(&mut conn).get_by_id(ticket_id).await?.ok_or_else(|| Error::NotFound {
            resource: "ticket".to_string(),
            id: ticket_id.to_string(),
        })?;
        let settings = Settings::new(&mut conn).load().await?;
        Ok((ticket, settings))
    }

    async fn load_user(&self, user_id: uuid::Uuid) -> Result<Option<UserDBResponse>, Error> {
        let mut conn = self.pool.acquire().await.map_err(|e| Error::Database(e.into()))?;
        Ok(Users::new(&mut conn).get_by_id(user_id).await?)
    }

    /// Threading headers for a message about `ticket`.
    fn thread_headers(&self, email: &EmailService, ticket: &TicketDBResponse) -> (Option<String>, Vec<String>) {
        let mut references = Vec::new();
        if let Some(original) = &ticket.message_id {
            references.push(original.clone());
        }
        references.push(email.ticket_thread_id(ticket.id));
        (ticket.message_id.clone(), references)
    }

    async fn deliver(&self, ticket: &TicketDBResponse, recipient: &UserDBResponse, subject: String, body: String) -> Result<(), Error> {
        let Some(email) = &self.email else {
            return Ok(());
        };
        let (in_reply_to, references) = self.thread_headers(email, ticket);
        email
            .send(OutgoingEmail {
                to_email: recipient.email.clone(),
                to_name: recipient.display_name.clone(),
                subject,
                body,
                message_id: Some(email.ticket_message_id(ticket.id)),
                in_reply_to,
                references,
            })
            .await?;
        debug!(to = %recipient.email, "Notification sent");
        Ok(())
    }

    async fn send_ticket_created(&self, ticket_id: TicketId) -> Result<(), Error> {
        let Some(email) = &self.email else {
            return Ok(());
        };
        let (ticket, settings) = self.load_ticket(ticket_id).await?;
        if !settings.notify_requester_on_create {
            return Ok(());
        }
        let Some(requester) = self.load_user(ticket.requester_id).await?.filter(wants_mail) else {
            return Ok(());
        };

        let reference = settings.reference_token(ticket.reference);
        let body = email.render_ticket_created(
            requester.name(),
            &settings.helpdesk_name,
            &reference,
            &ticket.subject,
            self.ticket_url(ticket.id).as_deref(),
        )?;
        self.deliver(&ticket, &requester, format!("{reference} {}", ticket.subject), body).await
    }

    async fn send_ticket_assigned(&self, ticket_id: TicketId) -> Result<(), Error> {
        let Some(email) = &self.email else {
            return Ok(());
        };
        let (ticket, settings) = self.load_ticket(ticket_id).await?;
        let Some(assignee_id) = ticket.assignee_id else {
            return Ok(());
        };
        let Some(assignee) = self.load_user(assignee_id).await?.filter(wants_mail) else {
            return Ok(());
        };

        let reference = settings.reference_token(ticket.reference);
        let body = email.render_ticket_assigned(
            assignee.name(),
            &reference,
            &ticket.subject,
            &ticket.requester_email,
            &ticket.priority_name,
            self.ticket_url(ticket.id).as_deref(),
        )?;
        self.deliver(&ticket, &assignee, format!("{reference} Assigned: {}", ticket.subject), body)
            .await
    }

    async fn send_comment_added(&self, ticket_id: TicketId, comment_id: CommentId) -> Result<(), Error> {
        let Some(email) = &self.email else {
            return Ok(());
        };
        let comment = {
            let mut conn = self.pool.acquire().await.map_err(|e| Error::Database(e.into()))?;
            Comments::new(&mut conn).get_by_id(comment_id).await?
        };
        let Some(comment) = comment.filter(|c| !c.is_internal) else {
            return Ok(());
        };
        let (ticket, settings) = self.load_ticket(ticket_id).await?;

        let author = match comment.author_id {
            Some(id) => self.load_user(id).await?,
            None => None,
        };
        let author_is_staff = author.as_ref().is_some_and(|a| a.role.is_staff());

        let recipient_id = if author_is_staff {
            if !self.config.notify_requester_on_comment {
                return Ok(());
            }
            Some(ticket.requester_id)
        } else {
            if !self.config.notify_assignee_on_comment {
                return Ok(());
            }
            ticket.assignee_id
        };
        let Some(recipient_id) = recipient_id.filter(|id| Some(*id) != comment.author_id) else {
            return Ok(());
        };
        let Some(recipient) = self.load_user(recipient_id).await?.filter(wants_mail) else {
            return Ok(());
        };

        let reference = settings.reference_token(ticket.reference);
        let author_name = author.as_ref().map(|a| a.name().to_string()).unwrap_or_else(|| comment.author_email.clone());
        let body = email.render_comment_added(
            recipient.name(),
            &author_name,
            &reference,
            &comment.body,
            self.ticket_url(ticket.id).as_deref(),
        )?;
        self.deliver(&ticket, &recipient, format!("Re: {reference} {}", ticket.subject), body)
            .await
    }
}

fn wants_mail(user: &UserDBResponse) -> bool {
    user.is_active && user.notify_by_email
}
