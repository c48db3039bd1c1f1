//! System settings persisted as key/value JSON rows.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Runtime-editable helpdesk settings. Missing keys fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SystemSettings {
    pub helpdesk_name: String,
    /// Prefix of the `[FD-1234]` subject token
    pub ticket_reference_prefix: String,
    pub clients_can_close_tickets: bool,
    pub clients_see_organization_tickets: bool,
    pub notify_requester_on_create: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            helpdesk_name: "FoxDesk".to_string(),
            ticket_reference_prefix: "FD".to_string(),
            clients_can_close_tickets: true,
            clients_see_organization_tickets: false,
            notify_requester_on_create: true,
        }
    }
}

impl SystemSettings {
    /// Subject token for a ticket reference, e.g. `[FD-1042]`.
    pub fn reference_token(&self, reference: i64) -> String {
        format!("[{}-{}]", self.ticket_reference_prefix, reference)
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SystemSettingsUpdate {
    pub helpdesk_name: Option<String>,
    pub ticket_reference_prefix: Option<String>,
    pub clients_can_close_tickets: Option<bool>,
    pub clients_see_organization_tickets: Option<bool>,
    pub notify_requester_on_create: Option<bool>,
}

impl SystemSettings {
    pub fn apply(&mut self, update: SystemSettingsUpdate) {
        if let Some(name) = update.helpdesk_name {
            self.helpdesk_name = name;
        }
        if let Some(prefix) = update.ticket_reference_prefix {
            self.ticket_reference_prefix = prefix;
        }
        if let Some(v) = update.clients_can_close_tickets {
            self.clients_can_close_tickets = v;
        }
        if let Some(v) = update.clients_see_organization_tickets {
            self.clients_see_organization_tickets = v;
        }
        if let Some(v) = update.notify_requester_on_create {
            self.notify_requester_on_create = v;
        }
    }
}
