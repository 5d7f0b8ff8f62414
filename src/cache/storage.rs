//! SQLite implementation of `CacheStorage`.

use chrono::{DateTime, Utc};
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::traits::{CacheStorage, CachedEntry, RequestKey};
use crate::db::Database;
use crate::error::{Result, WorkerError};

/// `worker_state` key holding the active store name.
const ACTIVE_STORE_KEY: &str = "active_store";
/// `worker_state` key holding the last store to finish installing.
const INSTALLED_STORE_KEY: &str = "installed_store";

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
  /// Upper bound on cached body bytes across all stores
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      quota_bytes: None,
    }
  }

  /// Limit the total size of cached bodies.
  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  /// Fail with `StorageExhausted` if writing `entries` would exceed the quota.
  fn check_quota(&self, tx: &Transaction<'_>, store: &str, entries: &[CachedEntry]) -> Result<()> {
    let Some(quota) = self.quota_bytes else {
      return Ok(());
    };

    let used: i64 = tx.query_row(
      "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM cache_entries",
      [],
      |row| row.get(0),
    )?;

    // A key repeated in one batch is written once, last value wins
    let mut batch: HashMap<String, u64> = HashMap::new();
    for entry in entries {
      batch.insert(entry.key.digest(), entry.body.len() as u64);
    }

    let mut needed = used.max(0) as u64;
    for (digest, len) in batch {
      let replaced: Option<i64> = tx
        .query_row(
          "SELECT LENGTH(body) FROM cache_entries WHERE store_name = ? AND key_hash = ?",
          params![store, digest],
          |row| row.get(0),
        )
        .optional()?;
      needed = needed.saturating_sub(replaced.unwrap_or(0).max(0) as u64);
      needed += len;
    }

    if needed > quota {
      return Err(WorkerError::StorageExhausted { needed, quota });
    }
    Ok(())
  }

  fn insert_store(tx: &Transaction<'_>, name: &str) -> Result<()> {
    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  fn insert_entry(tx: &Transaction<'_>, store: &str, entry: &CachedEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (store_name, key_hash, method, url, status, status_text, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        store,
        entry.key.digest(),
        entry.key.method().as_str(),
        entry.key.url().as_str(),
        entry.status,
        entry.status_text,
        headers,
        entry.body,
        entry.stored_at.to_rfc3339(),
      ],
    )?;
    Ok(())
  }
}

/// Row shape of `cache_entries`, decoded outside the lock.
struct EntryRow {
  method: String,
  url: String,
  status: u16,
  status_text: String,
  headers: String,
  body: Vec<u8>,
  stored_at: String,
}

impl EntryRow {
  fn into_entry(self) -> Result<CachedEntry> {
    let method = Method::from_bytes(self.method.as_bytes()).map_err(|e| WorkerError::InvalidUrl {
      url: self.url.clone(),
      reason: format!("bad stored method {}: {}", self.method, e),
    })?;
    let url = Url::parse(&self.url).map_err(|e| WorkerError::InvalidUrl {
      url: self.url.clone(),
      reason: e.to_string(),
    })?;

    Ok(CachedEntry {
      key: RequestKey::new(method, url),
      status: self.status,
      status_text: self.status_text,
      headers: serde_json::from_str(&self.headers)?,
      body: self.body,
      stored_at: parse_datetime(&self.stored_at)?,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn create_store(&self, name: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      Self::insert_store(&tx, name)?;
      tx.commit()?;
      Ok(())
    })
  }

  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let row = self.db.with_conn(|conn| {
      let row = conn
        .query_row(
          "SELECT method, url, status, status_text, headers, body, stored_at
           FROM cache_entries WHERE store_name = ? AND key_hash = ?",
          params![store, key.digest()],
          |row| {
            Ok(EntryRow {
              method: row.get(0)?,
              url: row.get(1)?,
              status: row.get(2)?,
              status_text: row.get(3)?,
              headers: row.get(4)?,
              body: row.get(5)?,
              stored_at: row.get(6)?,
            })
          },
        )
        .optional()?;
      Ok(row)
    })?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn put(&self, store: &str, entry: &CachedEntry) -> Result<()> {
    self.put_all(store, std::slice::from_ref(entry))
  }

  fn put_all(&self, store: &str, entries: &[CachedEntry]) -> Result<()> {
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      self.check_quota(&tx, store, entries)?;
      Self::insert_store(&tx, store)?;
      for entry in entries {
        Self::insert_entry(&tx, store, entry)?;
      }
      tx.commit()?;
      Ok(())
    })?;

    debug!(store, count = entries.len(), "Stored cache entries");
    Ok(())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let tx = conn.transaction()?;
      tx.execute("DELETE FROM cache_entries WHERE store_name = ?", params![name])?;
      let removed = tx.execute("DELETE FROM cache_stores WHERE name = ?", params![name])?;
      tx.commit()?;
      Ok(removed > 0)
    })
  }

  fn list_store_names(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT name FROM cache_stores ORDER BY created_at, name")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }

  #[cfg(test)]
  fn entry_count(&self, store: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store_name = ?",
        params![store],
        |row| row.get(0),
      )?;
      Ok(count.max(0) as usize)
    })
  }

  fn active_store(&self) -> Result<Option<String>> {
    self.state_value(ACTIVE_STORE_KEY)
  }

  fn set_active_store(&self, name: &str) -> Result<()> {
    self.set_state_value(ACTIVE_STORE_KEY, name)
  }

  fn installed_store(&self) -> Result<Option<String>> {
    self.state_value(INSTALLED_STORE_KEY)
  }

  fn set_installed_store(&self, name: &str) -> Result<()> {
    self.set_state_value(INSTALLED_STORE_KEY, name)
  }
}

impl SqliteStorage {
  fn state_value(&self, key: &str) -> Result<Option<String>> {
    self.db.with_conn(|conn| {
      let value = conn
        .query_row(
          "SELECT value FROM worker_state WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()?;
      Ok(value)
    })
  }

  fn set_state_value(&self, key: &str, value: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO worker_state (key, value) VALUES (?, ?)",
        params![key, value],
      )?;
      Ok(())
    })
  }
}

/// Parse an RFC 3339 timestamp as written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      WorkerError::Storage(rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(e),
      ))
    })
}
