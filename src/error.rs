use std::io;

use thiserror::Error;

/// Errors surfaced by the message store engine.
///
/// Multi-row operations are all-or-nothing at the transaction boundary:
/// an error from an individual operation leaves the transaction open and
/// abortable, never partially committed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failure in the backing store (connection or statement).
    #[error("backing store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fatal at startup: unknown schema version or table creation failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A multi-row invariant was violated; abort the enclosing transaction.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A persisted record could not be decoded. Non-recoverable for that
    /// message, but unrelated operations are unaffected.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("message {0} not found")]
    MessageNotFound(i64),

    /// Operation attempted after the store was closed.
    #[error("message store is closed")]
    StoreClosed,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
