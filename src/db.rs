//! SQLite connection shared by the cache store and the sync queue.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Result, WorkerError};

/// A single SQLite connection guarded by a mutex.
///
/// The lock is held for one synchronous statement or transaction at a time
/// and never across an await point.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open (or create) the database file at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "Opened worker database");
    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Run `f` with exclusive access to the connection.
  pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| WorkerError::LockPoisoned(e.to_string()))?;
    f(&mut conn)
  }
}

/// Schema for worker tables.
const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named, versioned cache stores ("<app>-v<version>")
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Cached responses keyed by request identity within a store
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (store_name, key_hash),
    FOREIGN KEY (store_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

-- Small key/value table for state that must survive restarts
CREATE TABLE IF NOT EXISTS worker_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Write-back operations waiting for connectivity
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;
