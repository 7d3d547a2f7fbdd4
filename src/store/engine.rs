//! Store facade and the engine state shared across handles,
//! transactions, and readers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::error::StoreError;
use crate::store::codec::MessageMetadata;
use crate::store::executor::CommitExecutor;
use crate::store::message::MessageHandle;
use crate::store::recovery::StoreReader;
use crate::store::schema::{self, TableNames};
use crate::store::txn::Transaction;

/// Message identifier: monotonically increasing, unique for the
/// lifetime of the store, never reused.
pub type MessageId = i64;

pub(crate) struct StoreInner {
    db_path: PathBuf,
    pub(crate) tables: TableNames,
    busy_timeout: Duration,
    next_id: AtomicI64,
    store_size: AtomicI64,
    open: AtomicBool,
    pub(crate) executor: CommitExecutor,
}

impl StoreInner {
    /// Open a dedicated connection. Every transaction and every read
    /// path gets its own; connections are never shared.
    pub(crate) fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(conn)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::StoreClosed)
        }
    }

    pub(crate) fn next_message_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a store-size delta to the broker-wide capacity figure.
    pub(crate) fn size_change(&self, delta: i64) {
        if delta != 0 {
            let total = self.store_size.fetch_add(delta, Ordering::SeqCst) + delta;
            debug!(delta, total, "store size changed");
        }
    }

    /// Reseed the id allocator from the maximum id observed across the
    /// three id-bearing tables, so fresh ids never collide with
    /// recovered data.
    fn set_maximum_message_id(&self, conn: &Connection) -> Result<()> {
        self.observe_max_id(
            conn,
            &format!("SELECT max(message_id) FROM {}", self.tables.message_content),
            0,
        )?;
        self.observe_max_id(
            conn,
            &format!("SELECT max(message_id) FROM {}", self.tables.message_metadata),
            0,
        )?;
        self.observe_max_id(
            conn,
            &format!(
                "SELECT queue_id, max(message_id) FROM {} GROUP BY queue_id",
                self.tables.queue_entries
            ),
            1,
        )?;
        Ok(())
    }

    fn observe_max_id(&self, conn: &Connection, sql: &str, column: usize) -> Result<()> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let max: Option<i64> = row.get(column)?;
            if let Some(max) = max
                && self.next_id.load(Ordering::SeqCst) < max
            {
                self.next_id.store(max, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// The persistent message store engine.
///
/// Cheap to clone conceptually (internally `Arc`-shared); callers on
/// any thread may allocate ids, create handles, begin transactions, and
/// read. All I/O blocks the calling thread except the physical commit
/// handed off by [`Transaction::commit_async`].
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("path", &self.inner.db_path)
            .field("open", &self.inner.open.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    /// Open (creating or upgrading as needed) the store described by
    /// `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let executor = CommitExecutor::new(&config.name, config.commit_threads.max(1))?;
        let inner = Arc::new(StoreInner {
            db_path: config.path.clone(),
            tables: TableNames::new(&config.table_prefix),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            next_id: AtomicI64::new(0),
            store_size: AtomicI64::new(0),
            open: AtomicBool::new(true),
            executor,
        });

        let conn = inner.connection()?;
        schema::upgrade(&conn, &inner.tables)?;
        schema::ensure_schema(&conn, &inner.tables)?;
        inner.set_maximum_message_id(&conn)?;

        info!(
            path = %config.path.display(),
            version = schema::DB_VERSION,
            "message store opened"
        );
        Ok(Self { inner })
    }

    /// Allocate the next message id: an atomic increment, strictly
    /// increasing for the process lifetime.
    pub fn next_message_id(&self) -> MessageId {
        self.inner.next_message_id()
    }

    /// Build a transient in-memory message handle with a fresh id.
    pub fn create_message(&self, metadata: MessageMetadata) -> Result<Arc<MessageHandle>> {
        self.inner.check_open()?;
        let id = self.inner.next_message_id();
        Ok(MessageHandle::resident(id, metadata, Arc::clone(&self.inner)))
    }

    /// Begin a transaction backed by its own exclusive connection.
    pub fn begin(&self) -> Result<Transaction> {
        self.inner.check_open()?;
        Transaction::begin(Arc::clone(&self.inner))
    }

    /// Read-only recovery interface.
    pub fn reader(&self) -> Result<StoreReader> {
        self.inner.check_open()?;
        Ok(StoreReader::new(Arc::clone(&self.inner)))
    }

    /// Net size delta accounted so far, in bytes.
    pub fn store_size(&self) -> i64 {
        self.inner.store_size.load(Ordering::SeqCst)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.tables.all().map(str::to_string).to_vec()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Stop accepting operations and shut down the commit pool.
    /// Queued asynchronous commits are drained first. Idempotent.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.executor.shutdown();
            info!(path = %self.inner.db_path.display(), "message store closed");
        }
    }

    /// Store teardown: drop every table. Intended for use after
    /// [`close`](Self::close).
    pub fn delete_store(&self) -> Result<()> {
        let conn = self.inner.connection()?;
        schema::drop_all(&conn, &self.inner.tables);
        Ok(())
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        self.close();
    }
}
