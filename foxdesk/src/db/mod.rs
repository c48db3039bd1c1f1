//! Database layer.
//!
//! SQLx over PostgreSQL, organized as repositories:
//!
//! ```text
//! API handlers / ingest pipeline / schedulers
//!        │
//!        ↓
//! db::handlers   repositories wrapping a &mut PgConnection (pool connection or transaction)
//!        │
//!        ↓
//! db::models     row structs and write requests
//!        │
//!        ↓
//! PostgreSQL     schema in migrations/
//! ```
//!
//! Repositories take a connection rather than a pool so callers decide the transaction
//! boundary; the ingest pipeline writes a whole message through one transaction.

pub mod errors;
pub mod handlers;
pub mod models;
