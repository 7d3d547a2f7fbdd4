//! Atomic multi-operation units of work against the backing store.
//!
//! Each transaction owns exactly one connection for its whole life and
//! releases it on every exit path: commit, abort, async hand-off, or
//! drop (which rolls back). Operations are applied to the store in call
//! order; pre-commit actions (deferred message stores) run at commit
//! time in submission order, post-commit callbacks after the commit.

use std::sync::Arc;

use rusqlite::{Connection, params};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::engine::{MessageId, StoreInner};
use crate::store::executor::CommitFuture;
use crate::store::message::MessageHandle;

/// Durable record that a message is enqueued on a queue. The row's
/// existence in the store is the sole source of truth for the
/// association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnqueueRecord {
    pub queue_id: Uuid,
    pub message_id: MessageId,
}

/// Identity of one branch of a distributed (XA-style) transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format: i64,
    pub global_id: Vec<u8>,
    pub branch_id: Vec<u8>,
}

impl Xid {
    pub fn new(format: i64, global_id: impl Into<Vec<u8>>, branch_id: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "xid({}, {}, {})",
            self.format,
            hex::encode(&self.global_id),
            hex::encode(&self.branch_id)
        )
    }
}

/// An enqueue effect recorded under an XA branch.
#[derive(Clone)]
pub struct XidEnqueue {
    pub queue_id: Uuid,
    pub message: Arc<MessageHandle>,
}

type PostCommitAction = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work backed by one exclusive store connection.
pub struct Transaction {
    inner: Arc<StoreInner>,
    conn: Option<Connection>,
    pending_stores: Vec<Arc<MessageHandle>>,
    post_commit: Vec<PostCommitAction>,
    size_delta: i64,
}

impl Transaction {
    pub(crate) fn begin(inner: Arc<StoreInner>) -> Result<Self> {
        let conn = inner.connection()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            inner,
            conn: Some(conn),
            pending_stores: Vec::new(),
            post_commit: Vec::new(),
            size_delta: 0,
        })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or_else(|| {
            StoreError::IntegrityViolation("transaction already completed".to_string())
        })
    }

    fn take_conn(&mut self) -> Result<Connection> {
        self.conn.take().ok_or_else(|| {
            StoreError::IntegrityViolation("transaction already completed".to_string())
        })
    }

    /// Record `message` as enqueued on `queue_id`.
    ///
    /// The queue-entry row is inserted immediately so constraint
    /// violations surface eagerly. Persisting the message itself is
    /// deferred to just before commit; that store is a no-op for an
    /// already durable message, but the message's content size joins
    /// the pending store-size delta on every enqueue.
    pub fn enqueue(
        &mut self,
        queue_id: Uuid,
        message: &Arc<MessageHandle>,
    ) -> Result<EnqueueRecord> {
        self.inner.check_open()?;
        self.pending_stores.push(Arc::clone(message));
        debug!(message_id = message.id(), queue_id = %queue_id, "enqueuing message");
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ( queue_id, message_id ) VALUES (?1, ?2)",
                self.inner.tables.queue_entries
            ),
            params![queue_id.to_string(), message.id()],
        )?;
        Ok(EnqueueRecord {
            queue_id,
            message_id: message.id(),
        })
    }

    /// Delete the queue-entry row for `record`. Anything but exactly
    /// one deleted row is an integrity violation and fails the
    /// operation (the transaction stays open and abortable).
    pub fn dequeue(&mut self, record: &EnqueueRecord) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.conn()?;
        let rows = conn.execute(
            &format!(
                "DELETE FROM {} WHERE queue_id = ?1 AND message_id = ?2",
                self.inner.tables.queue_entries
            ),
            params![record.queue_id.to_string(), record.message_id],
        )?;
        if rows != 1 {
            return Err(StoreError::IntegrityViolation(format!(
                "message {} not enqueued on queue {}",
                record.message_id, record.queue_id
            )));
        }
        debug!(message_id = record.message_id, queue_id = %record.queue_id, "dequeued message");
        Ok(())
    }

    /// Record an in-doubt XA branch together with its effects. The
    /// branch and action rows are written immediately; messages among
    /// the enqueues that are not yet durable are persisted now, within
    /// this transaction.
    pub fn record_xid(
        &mut self,
        xid: &Xid,
        enqueues: &[XidEnqueue],
        dequeues: &[EnqueueRecord],
    ) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.conn()?;
        let tables = &self.inner.tables;

        conn.execute(
            &format!(
                "INSERT INTO {} ( format, global_id, branch_id ) VALUES (?1, ?2, ?3)",
                tables.xids
            ),
            params![xid.format, xid.global_id, xid.branch_id],
        )?;

        for enqueue in enqueues {
            enqueue.message.store(conn)?;
        }

        let action_sql = format!(
            "INSERT INTO {} ( format, global_id, branch_id, action_type, queue_id, message_id ) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            tables.xid_actions
        );
        for enqueue in enqueues {
            conn.execute(
                &action_sql,
                params![
                    xid.format,
                    xid.global_id,
                    xid.branch_id,
                    "E",
                    enqueue.queue_id.to_string(),
                    enqueue.message.id()
                ],
            )?;
        }
        for dequeue in dequeues {
            conn.execute(
                &action_sql,
                params![
                    xid.format,
                    xid.global_id,
                    xid.branch_id,
                    "D",
                    dequeue.queue_id.to_string(),
                    dequeue.message_id
                ],
            )?;
        }

        debug!(%xid, enqueues = enqueues.len(), dequeues = dequeues.len(), "recorded xid");
        Ok(())
    }

    /// Remove a resolved XA branch and all its action rows. A branch
    /// with no stored row is an integrity violation.
    pub fn remove_xid(&mut self, xid: &Xid) -> Result<()> {
        self.inner.check_open()?;
        let conn = self.conn()?;
        let tables = &self.inner.tables;

        let rows = conn.execute(
            &format!(
                "DELETE FROM {} WHERE format = ?1 AND global_id = ?2 AND branch_id = ?3",
                tables.xids
            ),
            params![xid.format, xid.global_id, xid.branch_id],
        )?;
        if rows != 1 {
            return Err(StoreError::IntegrityViolation(format!(
                "no stored transaction branch found for {xid}"
            )));
        }

        conn.execute(
            &format!(
                "DELETE FROM {} WHERE format = ?1 AND global_id = ?2 AND branch_id = ?3",
                tables.xid_actions
            ),
            params![xid.format, xid.global_id, xid.branch_id],
        )?;

        debug!(%xid, "removed xid");
        Ok(())
    }

    /// Register a callback to run after the transaction commits.
    pub fn add_post_commit<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_commit.push(Box::new(action));
    }

    /// Commit synchronously: pre-commit actions, physical COMMIT,
    /// connection release, size-delta accounting, post-commit
    /// callbacks, in that order.
    pub fn commit(mut self) -> Result<()> {
        self.inner.check_open()?;
        self.run_pre_commit()?;
        let conn = self.take_conn()?;
        conn.execute_batch("COMMIT")?;
        drop(conn);
        debug!("transaction committed");

        self.inner.size_change(self.size_delta);
        self.size_delta = 0;
        self.run_post_commit();
        Ok(())
    }

    /// Commit asynchronously: pre-commit actions run on the caller, then
    /// the physical COMMIT is handed to the background pool and the
    /// returned future resolves with `value` once it succeeds.
    ///
    /// Size accounting and post-commit callbacks fire on the caller's
    /// thread before the background commit is confirmed. This optimistic
    /// accounting favors throughput; if the commit then fails, the size
    /// figure is not rolled back.
    pub fn commit_async<T>(mut self, value: T) -> Result<CommitFuture<T>>
    where
        T: Send + 'static,
    {
        self.inner.check_open()?;
        self.run_pre_commit()?;
        let conn = self.take_conn()?;

        let (sender, future) = CommitFuture::new();
        self.inner.executor.submit(Box::new(move || {
            match conn.execute_batch("COMMIT") {
                Ok(()) => {
                    debug!("async commit completed");
                    let _ = sender.send(Ok(value));
                }
                Err(e) => {
                    error!(error = %e, "async commit failed");
                    let _ = sender.send(Err(e.into()));
                }
            }
        }))?;

        self.inner.size_change(self.size_delta);
        self.size_delta = 0;
        self.run_post_commit();
        Ok(future)
    }

    /// Abort: discard pending pre-commit actions (nothing was written
    /// by them) and roll back everything written so far.
    pub fn abort(mut self) -> Result<()> {
        self.inner.check_open()?;
        self.pending_stores.clear();
        self.post_commit.clear();
        let conn = self.take_conn()?;
        conn.execute_batch("ROLLBACK")?;
        debug!("transaction aborted");
        Ok(())
    }

    fn run_pre_commit(&mut self) -> Result<()> {
        if self.pending_stores.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_stores);
        let Some(conn) = self.conn.as_ref() else {
            return Err(StoreError::IntegrityViolation(
                "transaction already completed".to_string(),
            ));
        };
        let mut delta = 0i64;
        for handle in &pending {
            handle.store(conn)?;
            delta += i64::from(handle.content_size());
        }
        self.size_delta += delta;
        Ok(())
    }

    fn run_post_commit(&mut self) {
        for action in std::mem::take(&mut self.post_commit) {
            action();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("rolling back unresolved transaction");
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}
