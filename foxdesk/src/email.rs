//! Outbound email: transport, templates and threading headers.
//!
//! Every message about a ticket carries a Message-ID of the form
//! `<foxdesk.<ticket uuid>.<nonce>@<domain>>` and the subject token `[<prefix>-<reference>]`,
//! so replies can be matched back to the ticket by the ingest pipeline.

use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use minijinja::{Environment, context};
use rand::{prelude::RngExt, rng};
use std::path::Path;
use uuid::Uuid;

use crate::{
    config::{Config, EmailTransportConfig},
    errors::Error,
    types::TicketId,
};

const TICKET_CREATED: &str = r#"Hello {{ name }},

Thank you for contacting {{ helpdesk_name }}.
We have received your request and opened ticket {{ reference }}.

Subject: {{ subject }}

Reply to this email to add more information.
Please keep {{ reference }} in the subject line.
{%- if ticket_url %}

You can follow your request at {{ ticket_url }}
{%- endif %}

{{ helpdesk_name }}
"#;

const TICKET_ASSIGNED: &str = r#"Hello {{ name }},

Ticket {{ reference }} has been assigned to you.

Subject: {{ subject }}
Requester: {{ requester }}
Priority: {{ priority }}
{%- if ticket_url %}

{{ ticket_url }}
{%- endif %}
"#;

const COMMENT_ADDED: &str = r#"Hello {{ name }},

{{ author }} added a reply to ticket {{ reference }}:

{{ body }}

Reply to this email to respond.
{%- if ticket_url %}

{{ ticket_url }}
{%- endif %}
"#;

const PASSWORD_RESET: &str = r#"Hello {{ name }},

We received a request to reset your {{ helpdesk_name }} password.
If you didn't make this request you can ignore this email.

To choose a new password, open this link:

{{ reset_link }}

The link expires in {{ expires_minutes }} minutes and can be used once.
"#;

/// A rendered message ready to send.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

pub struct EmailService {
    transport: EmailTransport,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    domain: String,
    templates: Environment<'static>,
}

impl EmailService {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let email_config = &config.email;

        let transport = match &email_config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port);

                let smtp_builder = if username.is_empty() {
                    smtp_builder
                } else {
                    smtp_builder.credentials(Credentials::new(username.clone(), password.clone()))
                };

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        let from = parse_mailbox(&email_config.from_email, Some(&email_config.from_name))?;
        let reply_to = match email_config.reply_to.as_deref() {
            Some(address) => Some(parse_mailbox(address, Some(&email_config.from_name))?),
            None => config
                .ingest
                .enabled
                .then(|| parse_mailbox(config.helpdesk_address(), Some(&email_config.from_name)))
                .transpose()?,
        };

        let mut templates = Environment::new();
        for (name, source) in [
            ("ticket_created", TICKET_CREATED),
            ("ticket_assigned", TICKET_ASSIGNED),
            ("comment_added", COMMENT_ADDED),
            ("password_reset", PASSWORD_RESET),
        ] {
            templates.add_template(name, source).map_err(|e| Error::Internal {
                operation: format!("load email template {name}: {e}"),
            })?;
        }

        Ok(Self {
            transport,
            domain: message_id_domain(&email_config.from_email),
            from,
            reply_to,
            templates,
        })
    }

    /// Domain used on the right-hand side of generated Message-IDs.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// A fresh Message-ID that identifies `ticket_id`.
    pub fn ticket_message_id(&self, ticket_id: TicketId) -> String {
        let mut nonce = [0u8; 8];
        rng().fill(&mut nonce);
        let nonce: String = nonce.iter().map(|b| format!("{b:02x}")).collect();
        format!("<foxdesk.{ticket_id}.{nonce}@{}>", self.domain)
    }

    /// Stable root id for a ticket's thread, used in `References`.
    pub fn ticket_thread_id(&self, ticket_id: TicketId) -> String {
        format!("<foxdesk.{ticket_id}.thread@{}>", self.domain)
    }

    pub fn render(&self, template: &str, ctx: minijinja::Value) -> Result<String, Error> {
        self.templates
            .get_template(template)
            .and_then(|t| t.render(ctx))
            .map_err(|e| Error::Internal {
                operation: format!("render email template {template}: {e}"),
            })
    }

    pub fn render_ticket_created(
        &self,
        name: &str,
        helpdesk_name: &str,
        reference: &str,
        subject: &str,
        ticket_url: Option<&str>,
    ) -> Result<String, Error> {
        self.render(
            "ticket_created",
            context! { name, helpdesk_name, reference, subject, ticket_url },
        )
    }

    pub fn render_ticket_assigned(
        &self,
        name: &str,
        reference: &str,
        subject: &str,
        requester: &str,
        priority: &str,
        ticket_url: Option<&str>,
    ) -> Result<String, Error> {
        self.render(
            "ticket_assigned",
            context! { name, reference, subject, requester, priority, ticket_url },
        )
    }

    pub fn render_comment_added(&self, name: &str, author: &str, reference: &str, body: &str, ticket_url: Option<&str>) -> Result<String, Error> {
        self.render("comment_added", context! { name, author, reference, body, ticket_url })
    }

    pub fn render_password_reset(&self, name: &str, helpdesk_name: &str, reset_link: &str, expires_minutes: u64) -> Result<String, Error> {
        self.render(
            "password_reset",
            context! { name, helpdesk_name, reset_link, expires_minutes },
        )
    }

    pub async fn send(&self, email: OutgoingEmail) -> Result<(), Error> {
        let to = parse_mailbox(&email.to_email, email.to_name.as_deref())?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject)
            .message_id(email.message_id)
            .header(ContentType::TEXT_PLAIN);
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        if let Some(in_reply_to) = email.in_reply_to {
            builder = builder.in_reply_to(in_reply_to);
        }
        if !email.references.is_empty() {
            builder = builder.references(email.references.join(" "));
        }

        let message = builder.body(email.body).map_err(|e| Error::Internal {
            operation: format!("build email message: {e}"),
        })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        Ok(())
    }
}

fn parse_mailbox(email: &str, name: Option<&str>) -> Result<Mailbox, Error> {
    let address: lettre::Address = email.parse().map_err(|e| Error::Internal {
        operation: format!("parse email address {email}: {e}"),
    })?;
    Ok(Mailbox::new(name.map(str::to_string).filter(|n| !n.is_empty()), address))
}

/// Domain part used in generated Message-IDs.
pub fn message_id_domain(from_email: &str) -> String {
    from_email
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "foxdesk.local".to_string())
}

/// Ticket id embedded in a Message-ID generated by [`EmailService::ticket_message_id`] or
/// [`EmailService::ticket_thread_id`]. Ids from any other domain are not ours.
pub fn parse_ticket_message_id(message_id: &str, domain: &str) -> Option<TicketId> {
    let inner = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    let (local, id_domain) = inner.rsplit_once('@')?;
    if !id_domain.eq_ignore_ascii_case(domain) {
        return None;
    }
    let rest = local.strip_prefix("foxdesk.")?;
    let (ticket, _nonce) = rest.split_once('.')?;
    Uuid::parse_str(ticket).ok()
}
