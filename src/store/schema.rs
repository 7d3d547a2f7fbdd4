//! Logical schema of the message store.
//!
//! Six tables hold everything: a single-row version gate, queue entries,
//! message metadata, message content, and the two distributed-transaction
//! tables. Creation is idempotent (checked by name against
//! `sqlite_master`, not by catching "table exists") and upgrades are
//! additive, applied as fall-through steps from the stored version up to
//! [`DB_VERSION`].

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Compiled-in schema version. A stored version above or outside the
/// known upgrade path is a fatal configuration error.
pub const DB_VERSION: i64 = 8;

const DB_VERSION_SUFFIX: &str = "db_version";
const QUEUE_ENTRIES_SUFFIX: &str = "queue_entries";
const MESSAGE_METADATA_SUFFIX: &str = "message_metadata";
const MESSAGE_CONTENT_SUFFIX: &str = "message_content";
const XIDS_SUFFIX: &str = "xids";
const XID_ACTIONS_SUFFIX: &str = "xid_actions";

/// Fully prefixed names of the six logical tables.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub db_version: String,
    pub queue_entries: String,
    pub message_metadata: String,
    pub message_content: String,
    pub xids: String,
    pub xid_actions: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            db_version: format!("{prefix}{DB_VERSION_SUFFIX}"),
            queue_entries: format!("{prefix}{QUEUE_ENTRIES_SUFFIX}"),
            message_metadata: format!("{prefix}{MESSAGE_METADATA_SUFFIX}"),
            message_content: format!("{prefix}{MESSAGE_CONTENT_SUFFIX}"),
            xids: format!("{prefix}{XIDS_SUFFIX}"),
            xid_actions: format!("{prefix}{XID_ACTIONS_SUFFIX}"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            &self.db_version,
            &self.message_metadata,
            &self.message_content,
            &self.queue_entries,
            &self.xids,
            &self.xid_actions,
        ]
    }
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Create any missing tables. Creating the version table seeds it with
/// the current [`DB_VERSION`].
pub fn ensure_schema(conn: &Connection, tables: &TableNames) -> Result<()> {
    create_version_table(conn, tables)?;
    create_queue_entries_table(conn, tables)?;
    create_metadata_table(conn, tables)?;
    create_content_table(conn, tables)?;
    create_xids_table(conn, tables)?;
    create_xid_actions_table(conn, tables)?;
    Ok(())
}

fn create_version_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.db_version)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( version INTEGER NOT NULL )",
            tables.db_version
        ))?;
        conn.execute(
            &format!("INSERT INTO {} ( version ) VALUES ( ?1 )", tables.db_version),
            [DB_VERSION],
        )?;
        debug!(version = DB_VERSION, "created version table");
    }
    Ok(())
}

fn create_queue_entries_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.queue_entries)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( queue_id TEXT NOT NULL, message_id INTEGER NOT NULL, \
             PRIMARY KEY (queue_id, message_id) )",
            tables.queue_entries
        ))?;
    }
    Ok(())
}

fn create_metadata_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.message_metadata)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( message_id INTEGER NOT NULL, meta_data BLOB, \
             PRIMARY KEY (message_id) )",
            tables.message_metadata
        ))?;
    }
    Ok(())
}

fn create_content_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.message_content)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( message_id INTEGER NOT NULL, content BLOB, \
             PRIMARY KEY (message_id) )",
            tables.message_content
        ))?;
    }
    Ok(())
}

fn create_xids_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.xids)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( format INTEGER NOT NULL, global_id BLOB NOT NULL, \
             branch_id BLOB NOT NULL, PRIMARY KEY (format, global_id, branch_id) )",
            tables.xids
        ))?;
    }
    Ok(())
}

fn create_xid_actions_table(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.xid_actions)? {
        conn.execute_batch(&format!(
            "CREATE TABLE {} ( format INTEGER NOT NULL, global_id BLOB NOT NULL, \
             branch_id BLOB NOT NULL, action_type TEXT NOT NULL, queue_id TEXT NOT NULL, \
             message_id INTEGER NOT NULL, \
             PRIMARY KEY (format, global_id, branch_id, action_type, queue_id, message_id) )",
            tables.xid_actions
        ))?;
    }
    Ok(())
}

/// Bring an existing store up to [`DB_VERSION`].
///
/// Upgrade steps fall through: a store at version 6 runs 6->7 and then
/// 7->8. A fresh store (no version table yet) needs nothing.
pub fn upgrade(conn: &Connection, tables: &TableNames) -> Result<()> {
    if !table_exists(conn, &tables.db_version)? {
        return Ok(());
    }

    let mut version = current_version(conn, tables)?;
    loop {
        match version {
            6 => {
                upgrade_from_v6(conn, tables)?;
                version = 7;
            }
            7 => {
                upgrade_from_v7(conn, tables)?;
                version = 8;
            }
            DB_VERSION => return Ok(()),
            other => {
                return Err(StoreError::Schema(format!("unknown database version: {other}")));
            }
        }
    }
}

pub fn current_version(conn: &Connection, tables: &TableNames) -> Result<i64> {
    let mut stmt = conn.prepare(&format!("SELECT version FROM {}", tables.db_version))?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(row.get(0)?),
        None => Err(StoreError::Schema(format!(
            "{} does not contain the database version",
            tables.db_version
        ))),
    }
}

fn upgrade_from_v6(conn: &Connection, tables: &TableNames) -> Result<()> {
    debug!("upgrading store from version 6");
    update_version(conn, tables, 7)
}

fn upgrade_from_v7(conn: &Connection, tables: &TableNames) -> Result<()> {
    debug!("upgrading store from version 7");
    update_version(conn, tables, 8)
}

fn update_version(conn: &Connection, tables: &TableNames, new_version: i64) -> Result<()> {
    conn.execute(
        &format!("UPDATE {} SET version = ?1", tables.db_version),
        [new_version],
    )?;
    Ok(())
}

/// Store teardown: drop every table, continuing past individual
/// failures.
pub fn drop_all(conn: &Connection, tables: &TableNames) {
    for table in tables.all() {
        if let Err(e) = conn.execute_batch(&format!("DROP TABLE {table}")) {
            warn!(table, error = %e, "failed to drop table");
        }
    }
}
