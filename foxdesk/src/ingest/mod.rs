//! Inbound email ingestion.
//!
//! An ingest run is one pass over the configured IMAP mailbox:
//!
//! 1. take the ingest advisory lock (a concurrent run is skipped, not queued)
//! 2. open an `email_ingest_runs` row
//! 3. list waiting message UIDs, oldest first, capped at `max_messages_per_run`
//! 4. per message: fetch, parse, dedupe on Message-ID, classify, write everything in one
//!    transaction and record an `email_ingest_logs` row
//! 5. move the message out of the inbox (or flag it `\Seen`; failures stay unflagged until
//!    they run out of attempts), then send notifications
//! 6. close the run with its counters
//!
//! The mailbox itself sits behind [`mailbox::MailSource`] so the pipeline runs against an
//! in-memory mailbox in tests.

pub mod classify;
pub mod mailbox;
pub mod message;
pub mod pipeline;
pub mod scheduler;
pub mod text;

use thiserror::Error;

use crate::{db::errors::DbError, errors::Error};

pub use mailbox::{ImapConnector, InMemoryMailbox, MailSource, MailSourceConnector};
pub use pipeline::{IngestPipeline, RunTrigger};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IMAP connection failed: {0}")]
    Connect(String),

    #[error("IMAP {command} failed: {message}")]
    Imap { command: &'static str, message: String },

    #[error("IMAP {0} timed out")]
    Timeout(&'static str),

    #[error("message uid {uid} not found in mailbox")]
    MissingMessage { uid: u32 },

    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Service(#[from] Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Database(err.into())
    }
}

impl From<IngestError> for Error {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Database(db) => Error::Database(db),
            IngestError::Service(e) => e,
            other => Error::Internal {
                operation: format!("ingest mail: {other}"),
            },
        }
    }
}
