//! HTTP request handlers for all API endpoints.
//!
//! Each handler validates the request, checks the caller's role, runs the business rules
//! against the repositories in [`crate::db::handlers`] and maps the result to a response model.
//!
//! # Handler Modules
//!
//! - [`auth`]: registration, login, logout, password reset and change, current user
//! - [`users`]: user administration and the caller's own profile
//! - [`organizations`]: client organizations and their members
//! - [`lookups`]: priorities, statuses and ticket types
//! - [`tickets`]: ticket CRUD, assignment and per-role visibility
//! - [`comments`]: public replies and internal notes
//! - [`attachments`]: multipart upload, download and deletion of ticket files
//! - [`time_entries`]: timers and manual time entries
//! - [`reports`]: time and ticket reports, saved report templates
//! - [`recurring_tasks`]: schedules that open tickets periodically
//! - [`settings`]: system settings
//! - [`ingest`]: manual ingest runs and the ingest history
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which converts to an HTTP status and a JSON body
//! with a user-safe message.

pub mod attachments;
pub mod auth;
pub mod comments;
pub mod ingest;
pub mod lookups;
pub mod organizations;
pub mod recurring_tasks;
pub mod reports;
pub mod settings;
pub mod tickets;
pub mod time_entries;
pub mod users;
