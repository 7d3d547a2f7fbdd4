//! Read-only visitation of persisted state, used at startup to replay
//! messages, queue entries, and in-doubt XA branches into the broker's
//! in-memory state.
//!
//! Each method invokes its handler once per record; a handler returning
//! `false` stops the iteration early.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::codec;
use crate::store::engine::{MessageId, StoreInner};
use crate::store::message::MessageHandle;
use crate::store::txn::{EnqueueRecord, Xid};

/// One in-doubt distributed-transaction branch with its effects, always
/// presented whole.
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub xid: Xid,
    pub enqueues: Vec<EnqueueRecord>,
    pub dequeues: Vec<EnqueueRecord>,
}

/// Read-only recovery interface over the store.
pub struct StoreReader {
    inner: Arc<StoreInner>,
}

impl StoreReader {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Point lookup of one message, as an evicted-content handle.
    pub fn get_message(&self, message_id: MessageId) -> Result<Option<Arc<MessageHandle>>> {
        self.inner.check_open()?;
        let conn = self.inner.connection()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT meta_data FROM {} WHERE message_id = ?1",
                    self.inner.tables.message_metadata
                ),
                [message_id],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => {
                let metadata = codec::decode_metadata(&bytes)?;
                Ok(Some(MessageHandle::recovered(
                    message_id,
                    metadata,
                    Arc::clone(&self.inner),
                )))
            }
            None => Ok(None),
        }
    }

    /// Visit every persisted message in ascending id order. Content is
    /// not loaded; each handle re-reads it on demand.
    pub fn visit_messages(
        &self,
        mut handler: impl FnMut(Arc<MessageHandle>) -> bool,
    ) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.inner.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, meta_data FROM {} ORDER BY message_id",
            self.inner.tables.message_metadata
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let message_id: MessageId = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let metadata = codec::decode_metadata(&bytes)?;
            let handle = MessageHandle::recovered(message_id, metadata, Arc::clone(&self.inner));
            if !handler(handle) {
                break;
            }
        }
        Ok(())
    }

    /// Visit queue entries, ordered by (queue id, message id); either
    /// for one queue or for all of them.
    pub fn visit_queue_entries(
        &self,
        queue: Option<Uuid>,
        mut handler: impl FnMut(EnqueueRecord) -> bool,
    ) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.inner.connection()?;
        let table = &self.inner.tables.queue_entries;

        let mut visit = |row: &rusqlite::Row<'_>| -> Result<bool> {
            let queue_id: String = row.get(0)?;
            let message_id: MessageId = row.get(1)?;
            let queue_id = parse_queue_id(&queue_id)?;
            Ok(handler(EnqueueRecord {
                queue_id,
                message_id,
            }))
        };

        match queue {
            Some(queue_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT queue_id, message_id FROM {table} WHERE queue_id = ?1 \
                     ORDER BY queue_id, message_id"
                ))?;
                let mut rows = stmt.query([queue_id.to_string()])?;
                while let Some(row) = rows.next()? {
                    if !visit(row)? {
                        break;
                    }
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT queue_id, message_id FROM {table} ORDER BY queue_id, message_id"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    if !visit(row)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Visit every in-doubt XA branch. For each branch the action rows
    /// are loaded and partitioned into enqueue and dequeue effects
    /// before the handler sees it; a branch is never presented
    /// partially.
    pub fn visit_distributed_transactions(
        &self,
        mut handler: impl FnMut(RecoveredTransaction) -> bool,
    ) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.inner.connection()?;
        let tables = &self.inner.tables;

        let mut xids = Vec::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT format, global_id, branch_id FROM {}",
                tables.xids
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                xids.push(Xid {
                    format: row.get(0)?,
                    global_id: row.get(1)?,
                    branch_id: row.get(2)?,
                });
            }
        }

        for xid in xids {
            let mut enqueues = Vec::new();
            let mut dequeues = Vec::new();

            let mut stmt = conn.prepare(&format!(
                "SELECT action_type, queue_id, message_id FROM {} \
                 WHERE format = ?1 AND global_id = ?2 AND branch_id = ?3",
                tables.xid_actions
            ))?;
            let mut rows =
                stmt.query(rusqlite::params![xid.format, xid.global_id, xid.branch_id])?;
            while let Some(row) = rows.next()? {
                let action_type: String = row.get(0)?;
                let queue_id: String = row.get(1)?;
                let message_id: MessageId = row.get(2)?;
                let record = EnqueueRecord {
                    queue_id: parse_queue_id(&queue_id)?,
                    message_id,
                };
                match action_type.as_str() {
                    "E" => enqueues.push(record),
                    "D" => dequeues.push(record),
                    other => {
                        return Err(StoreError::CorruptRecord(format!(
                            "unknown xid action type {other:?} for {xid}"
                        )));
                    }
                }
            }

            if !handler(RecoveredTransaction {
                xid,
                enqueues,
                dequeues,
            }) {
                break;
            }
        }
        Ok(())
    }
}

fn parse_queue_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| StoreError::CorruptRecord(format!("invalid queue id {raw:?}: {e}")))
}
