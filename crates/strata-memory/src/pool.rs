//! Shared SQLite handle plus the permit pools that bound concurrent store work.
//!
//! All stores share one `Arc<Mutex<Connection>>`. Concurrency is bounded by two
//! semaphores: foreground permits for ingestion and reads, and a reserved
//! background set for housekeeping and reconciliation so those passes are
//! never starved by a burst of writes.

use crate::migration::run_migrations;
use crate::{db_err, lock_err};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_types::config::PoolConfig;
use strata_types::error::{StrataError, StrataResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Connection handle and permit pools.
#[derive(Clone)]
pub struct StorePool {
    conn: Arc<Mutex<Connection>>,
    foreground: Arc<Semaphore>,
    background: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl StorePool {
    /// Open the database named by `database_url` and run migrations.
    ///
    /// Accepts `sqlite://<path>`, a bare path, or `:memory:`. A leading `~`
    /// is expanded to the home directory and missing parent directories are
    /// created.
    pub fn open(database_url: &str, config: &PoolConfig) -> StrataResult<Self> {
        config.validate()?;
        let conn = match resolve_database_path(database_url) {
            None => Connection::open_in_memory().map_err(db_err)?,
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(&path).map_err(db_err)?;
                // journal_mode returns a row, so it cannot go through execute().
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                    .map_err(db_err)?;
                info!(path = %path.display(), "Opened packet database");
                conn
            }
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(db_err)?;
        run_migrations(&conn).map_err(db_err)?;
        Ok(Self::from_connection(conn, config))
    }

    /// Wrap an already-migrated connection.
    pub fn from_connection(conn: Connection, config: &PoolConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            foreground: Arc::new(Semaphore::new(config.foreground_permits())),
            background: Arc::new(Semaphore::new(config.min_connections.max(1))),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    /// An in-memory, migrated pool with default bounds.
    pub fn in_memory() -> StrataResult<Self> {
        Self::open(":memory:", &PoolConfig::default())
    }

    /// The shared connection handle.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Acquire a foreground permit (ingestion, reads).
    pub async fn acquire(&self) -> StrataResult<OwnedSemaphorePermit> {
        acquire_from(self.foreground.clone(), self.acquire_timeout).await
    }

    /// Acquire a background permit (housekeeping, reconciliation).
    pub async fn acquire_background(&self) -> StrataResult<OwnedSemaphorePermit> {
        acquire_from(self.background.clone(), self.acquire_timeout).await
    }

    /// Foreground permits currently free.
    pub fn available_permits(&self) -> usize {
        self.foreground.available_permits()
    }

    /// Liveness probe: the database answers a trivial query.
    pub fn ping(&self) -> StrataResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;
        Ok(())
    }
}

async fn acquire_from(
    semaphore: Arc<Semaphore>,
    timeout: Duration,
) -> StrataResult<OwnedSemaphorePermit> {
    match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(StrataError::StorageUnavailable(
            "store pool closed".to_string(),
        )),
        Err(_) => Err(StrataError::StorageUnavailable(format!(
            "timed out after {}ms waiting for a store permit",
            timeout.as_millis()
        ))),
    }
}

/// Resolve a database URL to a file path; `None` means in-memory.
fn resolve_database_path(database_url: &str) -> Option<PathBuf> {
    let raw = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
        .trim();
    if raw.is_empty() || raw == ":memory:" {
        return None;
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        return Some(home.join(rest));
    }
    Some(PathBuf::from(raw))
}
