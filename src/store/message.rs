//! Per-message lifecycle and the memory/disk tiering policy.
//!
//! A handle starts *resident* (metadata and content held only in
//! memory), becomes *persisted* once its rows are written, may be
//! *evicted* ("flow to disk") to release its buffers, and ends
//! *removed*. Transitions never reverse, except that an evicted
//! message's data is re-read from the store on demand and cached again.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::codec::{self, ContentView, MessageMetadata};
use crate::store::engine::{MessageId, StoreInner};

enum MessageData {
    /// In memory only, not yet durable. Never evicted.
    Resident {
        metadata: MessageMetadata,
        content: Vec<Arc<[u8]>>,
    },
    /// Durable; cached copies may still be present.
    Persisted {
        metadata: Option<MessageMetadata>,
        content: Option<Vec<Arc<[u8]>>>,
    },
    /// Durable; nothing cached.
    Evicted,
    /// Terminal: no data, no store rows.
    Removed,
}

impl MessageData {
    fn name(&self) -> &'static str {
        match self {
            Self::Resident { .. } => "resident",
            Self::Persisted { .. } => "persisted",
            Self::Evicted => "evicted",
            Self::Removed => "removed",
        }
    }
}

/// Handle to one message's metadata and content.
///
/// State transitions are serialized by an internal mutex; reads that hit
/// the in-memory cache contend only on that lock, never on the backing
/// store.
pub struct MessageHandle {
    id: MessageId,
    content_size: u32,
    store: Arc<StoreInner>,
    data: Mutex<MessageData>,
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("id", &self.id)
            .field("state", &self.data.lock().name())
            .finish_non_exhaustive()
    }
}

impl MessageHandle {
    pub(crate) fn resident(
        id: MessageId,
        metadata: MessageMetadata,
        store: Arc<StoreInner>,
    ) -> Arc<Self> {
        let content_size = metadata.content_size;
        Arc::new(Self {
            id,
            content_size,
            store,
            data: Mutex::new(MessageData::Resident {
                metadata,
                content: Vec::new(),
            }),
        })
    }

    /// Handle for a message recovered from the store: durable, metadata
    /// cached, content not loaded.
    pub(crate) fn recovered(
        id: MessageId,
        metadata: MessageMetadata,
        store: Arc<StoreInner>,
    ) -> Arc<Self> {
        let content_size = metadata.content_size;
        Arc::new(Self {
            id,
            content_size,
            store,
            data: Mutex::new(MessageData::Persisted {
                metadata: Some(metadata),
                content: None,
            }),
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Declared content length, used for size accounting.
    pub fn content_size(&self) -> u32 {
        self.content_size
    }

    /// Append a content chunk. Only valid before the message is first
    /// persisted.
    pub fn add_content(&self, chunk: impl Into<Arc<[u8]>>) -> Result<()> {
        let mut data = self.data.lock();
        match &mut *data {
            MessageData::Resident { content, .. } => {
                content.push(chunk.into());
                Ok(())
            }
            other => Err(StoreError::IntegrityViolation(format!(
                "cannot add content to {} message {}",
                other.name(),
                self.id
            ))),
        }
    }

    /// True while any of the message's data is held in memory.
    pub fn is_in_memory(&self) -> bool {
        match &*self.data.lock() {
            MessageData::Resident { .. } => true,
            MessageData::Persisted { metadata, content } => {
                metadata.is_some() || content.is_some()
            }
            MessageData::Evicted | MessageData::Removed => false,
        }
    }

    /// Write the metadata and content rows on `conn` (both or neither,
    /// within the caller's transaction) and drop to a soft reference.
    /// No-op once durable.
    pub(crate) fn store(&self, conn: &Connection) -> Result<bool> {
        let mut data = self.data.lock();
        match &mut *data {
            MessageData::Resident { metadata, content } => {
                self.write_rows(conn, metadata, content)?;
                debug!(message_id = self.id, "stored message");
                let metadata = metadata.clone();
                let content = std::mem::take(content);
                *data = MessageData::Persisted {
                    metadata: Some(metadata),
                    content: Some(content),
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Ensure the message is durable, then release its in-memory
    /// buffers. A not-yet-durable message is stored and committed in a
    /// standalone transaction first. Succeeds even when there was
    /// nothing to release.
    pub fn flow_to_disk(&self) -> Result<()> {
        let mut data = self.data.lock();
        match &mut *data {
            MessageData::Resident { metadata, content } => {
                self.store.check_open()?;
                let conn = self.store.connection()?;
                conn.execute_batch("BEGIN IMMEDIATE")?;
                if let Err(e) = self.write_rows(&conn, metadata, content) {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
                conn.execute_batch("COMMIT")?;
                self.store.size_change(i64::from(self.content_size));
                debug!(message_id = self.id, "flowed message to disk");
                *data = MessageData::Evicted;
                Ok(())
            }
            MessageData::Persisted { .. } => {
                *data = MessageData::Evicted;
                Ok(())
            }
            MessageData::Evicted | MessageData::Removed => Ok(()),
        }
    }

    /// The message's metadata, re-read from the store and cached if it
    /// was evicted.
    pub fn metadata(&self) -> Result<MessageMetadata> {
        let mut data = self.data.lock();
        match &mut *data {
            MessageData::Resident { metadata, .. } => Ok(metadata.clone()),
            MessageData::Persisted {
                metadata: Some(metadata),
                ..
            } => Ok(metadata.clone()),
            MessageData::Persisted {
                metadata: slot @ None,
                ..
            } => {
                let metadata = self.load_metadata()?;
                *slot = Some(metadata.clone());
                Ok(metadata)
            }
            MessageData::Evicted => {
                let metadata = self.load_metadata()?;
                *data = MessageData::Persisted {
                    metadata: Some(metadata.clone()),
                    content: None,
                };
                Ok(metadata)
            }
            MessageData::Removed => Err(StoreError::MessageNotFound(self.id)),
        }
    }

    /// Zero-copy views over `[offset, offset + length)` of the content,
    /// re-read from the store and cached if it was evicted.
    pub fn content(&self, offset: usize, length: usize) -> Result<Vec<ContentView>> {
        let mut data = self.data.lock();
        match &mut *data {
            MessageData::Resident { content, .. } => {
                Ok(codec::content_views(content, offset, length))
            }
            MessageData::Persisted {
                content: Some(content),
                ..
            } => Ok(codec::content_views(content, offset, length)),
            MessageData::Persisted {
                content: slot @ None,
                ..
            } => {
                let loaded = self.load_content()?;
                let views = codec::content_views(&loaded, offset, length);
                *slot = Some(loaded);
                Ok(views)
            }
            MessageData::Evicted => {
                let loaded = self.load_content()?;
                let views = codec::content_views(&loaded, offset, length);
                *data = MessageData::Persisted {
                    metadata: None,
                    content: Some(loaded),
                };
                Ok(views)
            }
            MessageData::Removed => Err(StoreError::MessageNotFound(self.id)),
        }
    }

    /// Delete the message's rows (when durable), release all buffers,
    /// and tombstone the handle. Removing an already removed message is
    /// a no-op.
    pub fn remove(&self) -> Result<()> {
        let mut data = self.data.lock();
        match &*data {
            MessageData::Removed => Ok(()),
            MessageData::Resident { .. } => {
                debug!(message_id = self.id, "removed transient message");
                *data = MessageData::Removed;
                Ok(())
            }
            MessageData::Persisted { .. } | MessageData::Evicted => {
                self.store.check_open()?;
                self.delete_rows()?;
                self.store.size_change(-i64::from(self.content_size));
                *data = MessageData::Removed;
                Ok(())
            }
        }
    }

    fn write_rows(
        &self,
        conn: &Connection,
        metadata: &MessageMetadata,
        content: &[Arc<[u8]>],
    ) -> Result<()> {
        let tables = &self.store.tables;
        let encoded = codec::encode_metadata(metadata);
        let rows = conn.execute(
            &format!(
                "INSERT INTO {} ( message_id, meta_data ) VALUES (?1, ?2)",
                tables.message_metadata
            ),
            params![self.id, encoded],
        )?;
        if rows == 0 {
            return Err(StoreError::IntegrityViolation(format!(
                "unable to add metadata for message {}",
                self.id
            )));
        }

        let body = codec::encode_content(content);
        conn.execute(
            &format!(
                "INSERT INTO {} ( message_id, content ) VALUES (?1, ?2)",
                tables.message_content
            ),
            params![self.id, body],
        )?;
        Ok(())
    }

    fn delete_rows(&self) -> Result<()> {
        let conn = self.store.connection()?;
        let tables = &self.store.tables;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<()> {
            let rows = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE message_id = ?1",
                    tables.message_metadata
                ),
                [self.id],
            )?;
            if rows == 0 {
                // Likely an application-initiated rollback raced the
                // remove; the row was never committed.
                debug!(message_id = self.id, "metadata row already absent on remove");
            }
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE message_id = ?1",
                    tables.message_content
                ),
                [self.id],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                debug!(message_id = self.id, "deleted message rows");
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn load_metadata(&self) -> Result<MessageMetadata> {
        self.store.check_open()?;
        let conn = self.store.connection()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT meta_data FROM {} WHERE message_id = ?1",
                    self.store.tables.message_metadata
                ),
                [self.id],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => codec::decode_metadata(&bytes),
            None => Err(StoreError::MessageNotFound(self.id)),
        }
    }

    fn load_content(&self) -> Result<Vec<Arc<[u8]>>> {
        self.store.check_open()?;
        let conn = self.store.connection()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT content FROM {} WHERE message_id = ?1",
                    self.store.tables.message_content
                ),
                [self.id],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => Ok(vec![Arc::from(bytes.into_boxed_slice())]),
            None => Err(StoreError::MessageNotFound(self.id)),
        }
    }
}
