//! Versioned response cache for offline support.
//!
//! This module provides the request-caching core:
//! - Named, versioned stores of responses keyed by request identity
//! - Network-first, cache-first and stale-while-revalidate strategies
//! - One in-flight network resolution per request key
//! - Offline mode (cached, stale or synthetic responses when the network is gone)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub(crate) use storage::parse_datetime;
pub use traits::{ActiveStore, CacheStorage, CachedEntry, RequestKey, Served};
#[cfg(test)]
pub use traits::ResponseSource;
