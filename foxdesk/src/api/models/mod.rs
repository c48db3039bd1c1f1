//! API request and response data models.
//!
//! These structures define the public JSON contract and are kept apart from the database
//! models in [`crate::db::models`], which they convert from with `From` impls. Every model is
//! annotated with `utoipa` so it shows up in the generated OpenAPI document.
//!
//! - [`auth`]: login, registration and password management payloads
//! - [`users`], [`organizations`]: people and the companies they belong to
//! - [`lookups`]: priorities, statuses and ticket types
//! - [`tickets`], [`comments`], [`attachments`], [`time_entries`]: ticket work
//! - [`reports`], [`recurring_tasks`], [`settings`], [`ingest`]: administration

pub mod attachments;
pub mod auth;
pub mod comments;
pub mod ingest;
pub mod lookups;
pub mod organizations;
pub mod pagination;
pub mod recurring_tasks;
pub mod reports;
pub mod tickets;
pub mod time_entries;
pub mod users;
