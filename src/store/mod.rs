//! Persistent message store: schema, codec, message tiering,
//! transactions, background commits, and recovery visitation.

pub mod codec;
pub mod engine;
pub mod executor;
pub mod message;
pub mod recovery;
pub mod schema;
pub mod txn;

pub use codec::{ContentView, MessageMetadata, MetadataType};
pub use engine::{MessageId, MessageStore};
pub use executor::CommitFuture;
pub use message::MessageHandle;
pub use recovery::{RecoveredTransaction, StoreReader};
pub use txn::{EnqueueRecord, Transaction, Xid, XidEnqueue};
