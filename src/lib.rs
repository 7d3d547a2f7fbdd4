//! Durable message-store engine for a message broker.
//!
//! Records messages, their queue placements, and in-doubt distributed
//! (XA-style) transaction branches in SQLite, with atomic multi-row
//! commits, crash-consistent recovery, and a memory/disk tiering policy
//! for message bodies ("flow to disk").

pub mod config;
pub mod error;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use store::{
    CommitFuture, ContentView, EnqueueRecord, MessageHandle, MessageId, MessageMetadata,
    MessageStore, MetadataType, RecoveredTransaction, StoreReader, Transaction, Xid, XidEnqueue,
};

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
