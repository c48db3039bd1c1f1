//! Repository implementations for database access.
//!
//! Each repository wraps a `&mut PgConnection`, so it works on a pooled connection or inside a
//! transaction:
//!
//! ```ignore
//! use foxdesk::db::handlers::{Repository, Tickets};
//!
//! let mut tx = pool.begin().await?;
//! let ticket = Tickets::new(&mut tx).get_by_id(ticket_id).await?;
//! tx.commit().await?;
//! ```
//!
//! Entities with full CRUD implement [`Repository`]; append-only or special-purpose tables
//! (comments, attachments, time entries, ingest bookkeeping) expose inherent methods only.

pub mod attachments;
pub mod comments;
pub mod ingest;
pub mod lookups;
pub mod organizations;
pub mod password_reset_tokens;
pub mod recurring_tasks;
pub mod reports;
pub mod repository;
pub mod settings;
pub mod tickets;
pub mod time_entries;
pub mod users;

pub use attachments::Attachments;
pub use comments::Comments;
pub use ingest::{IngestLogs, IngestRuns};
pub use lookups::{Lookups, TicketDefaults};
pub use organizations::Organizations;
pub use password_reset_tokens::PasswordResetTokens;
pub use recurring_tasks::RecurringTasks;
pub use reports::{ReportTemplates, Reports};
pub use repository::Repository;
pub use settings::Settings;
pub use tickets::Tickets;
pub use time_entries::TimeEntries;
pub use users::Users;
