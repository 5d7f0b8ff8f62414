//! Error taxonomy for the worker core.
//!
//! None of these are fatal to the process. Each one is handled at the point
//! where it surfaces: a network failure falls back to cache, storage
//! exhaustion skips the write, an incomplete install leaves the previous
//! version serving, a malformed push is dropped.

use thiserror::Error;

use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("Network failure: {0}")]
  NetworkFailure(#[from] NetworkError),

  #[error("Storage exhausted: need {needed} bytes, quota is {quota} bytes")]
  StorageExhausted { needed: u64, quota: u64 },

  #[error("Install of {store} incomplete: {url} failed ({reason})")]
  InstallIncomplete {
    store: String,
    url: String,
    reason: String,
  },

  #[error("Malformed push payload: {0}")]
  MalformedPushPayload(String),

  #[error("Sync item {id} failed: {reason}")]
  SyncItemFailed { id: i64, reason: String },

  #[error("Invalid lifecycle state: {0}")]
  InvalidState(String),

  #[error("Invalid URL {url}: {reason}")]
  InvalidUrl { url: String, reason: String },

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;
