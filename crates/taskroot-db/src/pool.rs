//! SQLite connection pool management.
//!
//! The dataset has exactly one writer: the pool holds a single connection
//! opened in exclusive locking mode, so a second process cannot write to the
//! same file while the owner runs.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePool, SqlitePoolOptions,
};
use tracing::{debug, info};

use taskroot_core::{Error, Result};

/// Default connection acquire timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default busy timeout in seconds while another process holds the lock.
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection acquire timeout.
    pub connect_timeout: Duration,
    /// How long SQLite waits on a locked file before failing.
    pub busy_timeout: Duration,
    /// Hold the file lock for the lifetime of the connection.
    pub exclusive: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            busy_timeout: Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS),
            exclusive: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Open a pool on `db_path`, or on a private in-memory dataset when `None`.
pub async fn create_pool(db_path: Option<&Path>) -> Result<SqlitePool> {
    create_pool_with_config(db_path, PoolConfig::default()).await
}

/// Open a pool with custom configuration.
pub async fn create_pool_with_config(
    db_path: Option<&Path>,
    config: PoolConfig,
) -> Result<SqlitePool> {
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        db_path = %db_path.map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".into()),
        exclusive = config.exclusive,
        "Opening dataset"
    );

    let mut options = match db_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Delete)
        }
        None => SqliteConnectOptions::from_str("sqlite::memory:").map_err(Error::Storage)?,
    };
    options = options.busy_timeout(config.busy_timeout);
    if config.exclusive {
        options = options.locking_mode(SqliteLockingMode::Exclusive);
    }

    // One connection, never recycled: an in-memory dataset lives exactly as
    // long as its connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(Error::Storage)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Dataset opened"
    );
    Ok(pool)
}

/// Remove a dataset file and its journal side files.
pub async fn purge_dataset(db_path: &Path) -> Result<()> {
    let mut removed = 0usize;
    for suffix in ["", "-journal", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        match tokio::fs::remove_file(&name).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    debug!(
        subsystem = "db",
        component = "pool",
        op = "purge",
        removed,
        "Purged dataset files"
    );
    Ok(())
}
