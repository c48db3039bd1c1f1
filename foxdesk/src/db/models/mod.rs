//! Database record models.
//!
//! Row structs derive `sqlx::FromRow`; write requests are plain structs consumed by the
//! repositories in [`crate::db::handlers`]. API models in [`crate::api::models`] convert from
//! these with `From` impls.

pub mod attachments;
pub mod comments;
pub mod ingest;
pub mod lookups;
pub mod organizations;
pub mod password_reset_tokens;
pub mod recurring_tasks;
pub mod reports;
pub mod settings;
pub mod tickets;
pub mod time_entries;
pub mod users;
