//! Deciding what an inbound message is: rejected, a reply to an existing ticket, or a new one.

use sqlx::PgConnection;
use tracing::debug;

use super::message::InboundMessage;
use crate::{
    config::IngestConfig,
    db::{
        errors::Result,
        handlers::{Repository, Tickets},
        models::{tickets::TicketDBResponse, users::UserDBResponse},
    },
    email::parse_ticket_message_id,
};

/// The helpdesk's own identity, used to spot mail it sent itself.
#[derive(Debug, Clone)]
pub struct OwnIdentity {
    pub address: String,
    /// Domain of the Message-IDs on outbound notifications
    pub message_id_domain: String,
}

/// Why a message is refused before anything is written, or `None` to accept it.
pub fn rejection_reason(message: &InboundMessage, config: &IngestConfig, own: &OwnIdentity) -> Option<String> {
    let Some(from) = message.from_email.as_deref() else {
        return Some("message has no sender address".to_string());
    };

    if from.eq_ignore_ascii_case(own.address.trim()) {
        return Some(format!("sender {from} is the helpdesk itself"));
    }
    if parse_ticket_message_id(&message.message_id, &own.message_id_domain).is_some() {
        return Some("message was generated by the helpdesk".to_string());
    }
    if config.sender_denylist.iter().any(|entry| sender_matches(from, entry)) {
        return Some(format!("sender {from} is on the denylist"));
    }
    if config.skip_auto_replies && message.auto_submitted {
        return Some("auto-submitted or bulk message".to_string());
    }
    None
}

/// `entry` is a full address or an `@domain` suffix.
fn sender_matches(from: &str, entry: &str) -> bool {
    let entry = entry.trim().to_lowercase();
    if entry.is_empty() {
        return false;
    }
    if entry.starts_with('@') { from.ends_with(&entry) } else { from == entry }
}

/// Ticket reference from a `[<prefix>-<n>]` or `[#<n>]` subject token.
pub fn subject_reference(subject: &str, prefix: &str) -> Option<i64> {
    let lower = subject.to_lowercase();
    let markers = [format!("[{}-", prefix.to_lowercase()), "[#".to_string()];

    markers.iter().find_map(|marker| {
        lower.match_indices(marker.as_str()).find_map(|(start, _)| {
            let rest = &lower[start + marker.len()..];
            let (digits, _) = rest.split_once(']')?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
    })
}

/// Find the ticket a message belongs to: the subject token first, then a helpdesk Message-ID
/// in the threading headers, then any stored inbound Message-ID those headers mention.
pub async fn find_ticket(
    conn: &mut PgConnection,
    message: &InboundMessage,
    reference_prefix: &str,
    message_id_domain: &str,
) -> Result<Option<TicketDBResponse>> {
    let mut tickets = Tickets::new(conn);

    if let Some(reference) = subject_reference(&message.subject, reference_prefix)
        && let Some(ticket) = tickets.get_by_reference(reference).await?
    {
        debug!(reference, "Matched ticket by subject token");
        return Ok(Some(ticket));
    }

    let thread_ids = message.thread_ids();
    for id in &thread_ids {
        if let Some(ticket_id) = parse_ticket_message_id(id, message_id_domain)
            && let Some(ticket) = tickets.get_by_id(ticket_id).await?
        {
            debug!(message_id = %id, "Matched ticket by helpdesk Message-ID");
            return Ok(Some(ticket));
        }
    }

    if thread_ids.is_empty() {
        return Ok(None);
    }
    match tickets.find_id_by_message_id(&thread_ids).await? {
        Some(ticket_id) => tickets.get_by_id(ticket_id).await,
        None => Ok(None),
    }
}

/// Replies are taken from the requester, staff, and members of the ticket's organization.
pub fn may_reply(ticket: &TicketDBResponse, sender: &UserDBResponse) -> bool {
    sender.id == ticket.requester_id
        || sender.role.is_staff()
        || (ticket.organization_id.is_some() && sender.organization_id == ticket.organization_id)
}
