//! Common type definitions and permission system types.
//!
//! This module defines:
//! - Type aliases for entity IDs (UserId, TicketId, etc.)
//! - Permission and authorization types
//! - Resource and operation enums for access control
//!
//! # Permission System
//!
//! - [`Resource`]: What entity type is being accessed (Tickets, Organizations, ...)
//! - [`Operation`]: What action is being performed (Read, Create, Update, Delete)
//! - [`Permission`]: Authorization requirement combining resource and operation
//!
//! Operations come in two flavors:
//! - **All**: Unrestricted access to all entities (e.g., `ReadAll`, `DeleteAll`)
//! - **Own**: Restricted to the caller's own entities (e.g., `ReadOwn`, `UpdateOwn`)
//!
//! Which role holds which permission is decided in [`crate::auth::permissions`].

use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type OrganizationId = Uuid;
pub type TicketId = Uuid;
pub type CommentId = Uuid;
pub type AttachmentId = Uuid;
pub type TimeEntryId = Uuid;
pub type LookupId = Uuid;
pub type RecurringTaskId = Uuid;
pub type ReportTemplateId = Uuid;
pub type IngestRunId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

// Common types for path parameters
#[derive(Debug, Clone, Deserialize)]
pub enum CurrentKeyword {
    #[serde(rename = "current")]
    Current,
}

/// Allows routes like /users/current and /users/{user_id} to hit the same handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UserIdOrCurrent {
    Current(CurrentKeyword),
    Id(UserId),
}

// *-All means unrestricted access, *-Own means restricted to own resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateAll,
    CreateOwn,
    ReadAll,
    ReadOwn,
    UpdateAll,
    UpdateOwn,
    DeleteAll,
    DeleteOwn,
    // System
    SystemAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Users,
    Organizations,
    Tickets,
    Comments,
    InternalComments,
    Attachments,
    TimeEntries,
    Lookups,
    RecurringTasks,
    Reports,
    Settings,
    Ingest,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Users => "users",
            Resource::Organizations => "organizations",
            Resource::Tickets => "tickets",
            Resource::Comments => "comments",
            Resource::InternalComments => "internal comments",
            Resource::Attachments => "attachments",
            Resource::TimeEntries => "time entries",
            Resource::Lookups => "lookups",
            Resource::RecurringTasks => "recurring tasks",
            Resource::Reports => "reports",
            Resource::Settings => "settings",
            Resource::Ingest => "email ingestion",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    /// Simple permission: (Resource, Operation)
    Allow(Resource, Operation),
    /// Caller must own or be related to the specific resource instance
    Granted,
    /// Logical combinators
    Any(Vec<Permission>),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateAll | Operation::CreateOwn => write!(f, "Create"),
            Operation::ReadAll | Operation::ReadOwn => write!(f, "Read"),
            Operation::UpdateAll | Operation::UpdateOwn => write!(f, "Update"),
            Operation::DeleteAll | Operation::DeleteOwn => write!(f, "Delete"),
            Operation::SystemAccess => write!(f, "Access"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_uuid() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }

    #[test]
    fn test_user_id_or_current() {
        let current: UserIdOrCurrent = serde_json::from_str("\"current\"").unwrap();
        assert!(matches!(current, UserIdOrCurrent::Current(_)));

        let id: UserIdOrCurrent = serde_json::from_str("\"550e8400-e29b-41d4-a716-446655440000\"").unwrap();
        assert!(matches!(id, UserIdOrCurrent::Id(_)));
    }
}
