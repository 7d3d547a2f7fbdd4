use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Default size of the background commit pool.
const DEFAULT_COMMIT_THREADS: usize = 4;

/// Default SQLite busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for a [`MessageStore`](crate::store::MessageStore).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file. Parent directories are created
    /// on open.
    pub path: PathBuf,

    /// Prefix applied uniformly to all six logical table names.
    #[serde(default)]
    pub table_prefix: String,

    /// Name used for background commit threads (`<name>-commit-N`).
    #[serde(default = "default_store_name")]
    pub name: String,

    /// Number of threads in the background commit pool.
    #[serde(default = "default_commit_threads")]
    pub commit_threads: usize,

    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_name() -> String {
    "mqstore".to_string()
}

fn default_commit_threads() -> usize {
    DEFAULT_COMMIT_THREADS
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Partial configuration, as read from a TOML file. Unset fields keep
/// the values already in place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfigPatch {
    pub path: Option<PathBuf>,
    pub table_prefix: Option<String>,
    pub name: Option<String>,
    pub commit_threads: Option<usize>,
    pub busy_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table_prefix: String::new(),
            name: default_store_name(),
            commit_threads: DEFAULT_COMMIT_THREADS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// Load configuration from a TOML file, then apply `MQSTORE_*`
    /// environment overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)?;
        let patch: StoreConfigPatch = toml::from_str(&text)
            .map_err(|e| StoreError::Config(format!("{}: {e}", config_path.display())))?;

        let Some(path) = patch.path.clone() else {
            return Err(StoreError::Config(format!(
                "{}: missing required key `path`",
                config_path.display()
            )));
        };

        let mut config = Self::new(path);
        config.merge_patch(patch);
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn merge_patch(&mut self, patch: StoreConfigPatch) {
        if let Some(path) = patch.path {
            self.path = path;
        }
        if let Some(prefix) = patch.table_prefix {
            self.table_prefix = prefix;
        }
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(threads) = patch.commit_threads {
            self.commit_threads = threads;
        }
        if let Some(timeout) = patch.busy_timeout_ms {
            self.busy_timeout_ms = timeout;
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(prefix) = std::env::var("MQSTORE_TABLE_PREFIX") {
            self.table_prefix = prefix;
        }
        if let Ok(threads) = std::env::var("MQSTORE_COMMIT_THREADS") {
            self.commit_threads = threads
                .parse()
                .map_err(|_| StoreError::Config(format!("invalid MQSTORE_COMMIT_THREADS: {threads}")))?;
        }
        if let Ok(timeout) = std::env::var("MQSTORE_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = timeout
                .parse()
                .map_err(|_| StoreError::Config(format!("invalid MQSTORE_BUSY_TIMEOUT_MS: {timeout}")))?;
        }
        Ok(())
    }
}
