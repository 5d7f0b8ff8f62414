//! Durable queue of writes that could not reach the origin.
//!
//! Items are replayed oldest first when a connectivity signal arrives. There
//! is no retry loop of its own: an item that fails stays queued until the
//! next trigger, up to a bounded number of attempts.

use chrono::{DateTime, Utc};
use reqwest::Method;
use rusqlite::params;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::parse_datetime;
use crate::db::Database;
use crate::error::{Result, WorkerError};
use crate::network::{Network, NetworkError, Request};

/// The write to replay: a non-GET request as the page issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPayload {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl SyncPayload {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method.to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }

  fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes()).map_err(|e| WorkerError::InvalidUrl {
      url: self.url.clone(),
      reason: format!("bad method {}: {}", self.method, e),
    })?;
    let url = Url::parse(&self.url).map_err(|e| WorkerError::InvalidUrl {
      url: self.url.clone(),
      reason: e.to_string(),
    })?;

    let mut request = Request::new(method, url);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

/// A queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSyncItem {
  pub id: i64,
  pub payload: SyncPayload,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
}

/// What a drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Replayed successfully and removed
  pub replayed: usize,
  /// Failed and kept for the next trigger
  pub failed: usize,
  /// Gave up on after too many attempts, or unreplayable
  pub dropped: usize,
}

/// Clears the draining flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// SQLite-backed FIFO of pending writes.
pub struct SyncQueue {
  db: Arc<Database>,
  max_attempts: u32,
  draining: AtomicBool,
}

impl SyncQueue {
  pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
    Self {
      db,
      max_attempts: max_attempts.max(1),
      draining: AtomicBool::new(false),
    }
  }

  /// Append a write with zero attempts. Returns its id.
  pub fn enqueue(&self, payload: &SyncPayload) -> Result<i64> {
    let headers = serde_json::to_string(&payload.headers)?;
    let id = self.db.with_conn(|conn| {
      conn.execute(
        "INSERT INTO sync_queue (method, url, headers, body, created_at, attempts)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          payload.method,
          payload.url,
          headers,
          payload.body,
          Utc::now().to_rfc3339()
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })?;

    info!(id, method = %payload.method, url = %payload.url, "Queued write for background sync");
    Ok(id)
  }

  /// Every queued item, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingSyncItem>> {
    type Row = (i64, String, String, String, Option<Vec<u8>>, String, u32);

    let rows: Vec<Row> = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT id, method, url, headers, body, created_at, attempts
         FROM sync_queue ORDER BY id",
      )?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        })?
        .collect::<rusqlite::Result<Vec<Row>>>()?;
      Ok(rows)
    })?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, created_at, attempts)| {
        Ok(PendingSyncItem {
          id,
          payload: SyncPayload {
            method,
            url,
            headers: serde_json::from_str(&headers)?,
            body,
          },
          created_at: parse_datetime(&created_at)?,
          attempts,
        })
      })
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
      Ok(count.max(0) as usize)
    })
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Replay every queued item once, oldest first, one at a time.
  ///
  /// A 2xx reply removes the item. Anything else bumps its attempt count;
  /// once that reaches the bound the item is dropped. A drain that starts
  /// while another is running does nothing.
  pub async fn drain<N: Network>(&self, network: &N, timeout: std::time::Duration) -> Result<DrainReport> {
    if self.draining.swap(true, Ordering::AcqRel) {
      debug!("Drain already in progress");
      return Ok(DrainReport::default());
    }

    let _guard = DrainGuard(&self.draining);
    self.drain_items(network, timeout).await
  }

  async fn drain_items<N: Network>(&self, network: &N, timeout: std::time::Duration) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    for item in self.pending()? {
      let request = match item.payload.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(id = item.id, error = %e, "Dropping unreplayable sync item");
          self.remove(item.id)?;
          report.dropped += 1;
          continue;
        }
      };

      match self.replay(network, item.id, request, timeout).await {
        Ok(()) => {
          self.remove(item.id)?;
          report.replayed += 1;
          debug!(id = item.id, "Replayed sync item");
        }
        Err(e) => {
          let attempts = item.attempts + 1;

          if attempts >= self.max_attempts {
            warn!(id = item.id, error = %e, attempts, "Giving up on sync item");
            self.remove(item.id)?;
            report.dropped += 1;
          } else {
            debug!(id = item.id, error = %e, attempts, "Sync item will be retried on next trigger");
            self.set_attempts(item.id, attempts)?;
            report.failed += 1;
          }
        }
      }
    }

    info!(
      replayed = report.replayed,
      failed = report.failed,
      dropped = report.dropped,
      "Background sync finished"
    );
    Ok(report)
  }

  async fn replay<N: Network>(
    &self,
    network: &N,
    id: i64,
    request: Request,
    timeout: std::time::Duration,
  ) -> Result<()> {
    let response = match tokio::time::timeout(timeout, network.fetch(request)).await {
      Ok(result) => result?,
      Err(_) => return Err(NetworkError::Timeout(timeout).into()),
    };

    if !response.is_success() {
      return Err(WorkerError::SyncItemFailed {
        id,
        reason: format!("origin replied {}", response.status),
      });
    }
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
      Ok(())
    })
  }

  fn set_attempts(&self, id: i64, attempts: u32) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute(
        "UPDATE sync_queue SET attempts = ? WHERE id = ?",
        params![attempts, id],
      )?;
      Ok(())
    })
  }
}
