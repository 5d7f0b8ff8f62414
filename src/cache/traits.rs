//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::error::Result;
use crate::network::{Request, Response};

/// Normalized identity of a request: method plus absolute URL.
///
/// Headers play no part; two requests with the same key are interchangeable
/// for caching purposes. The fragment is never sent to the origin and is
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.clone(), request.url.clone())
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Only GET responses are ever read from or written to a store.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// SHA256 of `"<METHOD> <url>"`, used as the stable storage key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response stored under a request key.
///
/// Entries are never mutated; an update writes a whole new entry over the
/// old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub key: RequestKey,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn from_response(key: RequestKey, response: &Response) -> Self {
    Self {
      key,
      status: response.status,
      status_text: response.status_text.clone(),
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  /// Check whether the entry is older than `ttl`.
  pub fn is_expired(&self, ttl: Duration) -> bool {
    Utc::now() - self.stored_at > ttl
  }
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. Exactly one of them is the
/// active store, recorded so that a restarted process knows which version
/// is live.
pub trait CacheStorage: Send + Sync + 'static {
  /// Register an empty store. No-op if it already exists.
  fn create_store(&self, name: &str) -> Result<()>;

  /// Look up an entry. Purely local, never touches the network.
  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Write an entry, replacing any previous one for the same key.
  ///
  /// Fails with `StorageExhausted` when the write would exceed the quota.
  fn put(&self, store: &str, entry: &CachedEntry) -> Result<()>;

  /// Write a batch of entries: either all become visible or none do.
  fn put_all(&self, store: &str, entries: &[CachedEntry]) -> Result<()>;

  /// Remove a store and everything in it. Returns false if it did not exist.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Names of every store on the device.
  fn list_store_names(&self) -> Result<Vec<String>>;

  /// Number of entries in a store.
  #[cfg(test)]
  fn entry_count(&self, store: &str) -> Result<usize>;

  /// The persisted active store name, if any version was ever activated.
  fn active_store(&self) -> Result<Option<String>>;

  /// Persist the active store name.
  fn set_active_store(&self, name: &str) -> Result<()>;

  /// The store whose install last completed, activated or not.
  fn installed_store(&self) -> Result<Option<String>>;

  /// Record that a store finished installing.
  fn set_installed_store(&self, name: &str) -> Result<()>;
}

/// Name of the store currently serving requests, shared between the
/// lifecycle manager (which swaps it on activation) and the strategies
/// (which read and write through it).
#[derive(Debug, Clone, Default)]
pub struct ActiveStore(Arc<RwLock<Option<String>>>);

impl ActiveStore {
  pub fn get(&self) -> Option<String> {
    match self.0.read() {
      Ok(name) => name.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn set(&self, name: &str) {
    let mut guard = match self.0.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(name.to_string());
  }
}

/// A response handed back to the page, with metadata about where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh data from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      stored_at: None,
    }
  }

  /// A cache hit.
  pub fn from_cache(entry: &CachedEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: ResponseSource::Cache,
      stored_at: Some(entry.stored_at),
    }
  }

  /// An expired cache entry served because the network failed.
  pub fn stale(entry: &CachedEntry) -> Self {
    Self {
      source: ResponseSource::Stale,
      ..Self::from_cache(entry)
    }
  }

  /// The offline page, cached or built-in.
  pub fn offline_fallback(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::OfflineFallback,
      stored_at: None,
    }
  }

  /// A response the worker made up (503 offline, 202 queued).
  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthetic,
      stored_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Response from the origin
  Network,
  /// Cache hit
  Cache,
  /// Expired cache entry served because the origin was unreachable
  Stale,
  /// Offline page for a navigation nobody could serve
  OfflineFallback,
  /// Made up by the worker
  Synthetic,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Stale => "stale",
      Self::OfflineFallback => "offline-fallback",
      Self::Synthetic => "synthetic",
    };
    f.write_str(name)
  }
}
