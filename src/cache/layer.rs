//! Cache layer that resolves requests between the active store and the network.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use super::traits::{ActiveStore, CacheStorage, CachedEntry, RequestKey, Served};
use crate::error::WorkerError;
use crate::network::{Network, NetworkError, Request, Response};
use crate::route::{RoutePolicy, Strategy};

/// A network resolution every caller for the same key can await.
type Resolution = Shared<BoxFuture<'static, Result<Response, NetworkError>>>;

/// A resolution plus the task behind it, which outlives the resolution by
/// the cache write.
struct Pending {
  response: Resolution,
  finished: Shared<BoxFuture<'static, ()>>,
}

type InFlight = Arc<Mutex<HashMap<RequestKey, Pending>>>;

/// Cache layer that applies a route's strategy to a request.
///
/// This layer sits between the fetch boundary and the network, reading and
/// writing whichever store is active at the time. At most one network
/// resolution per request key is in flight; later callers for that key
/// attach to it instead of fetching again.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  active: ActiveStore,
  in_flight: InFlight,
  /// Bound on every network fetch; exceeding it counts as a failure
  timeout: Duration,
  /// Page served to navigations when nothing else can be
  offline_url: Url,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    active: ActiveStore,
    timeout: Duration,
    offline_url: Url,
  ) -> Self {
    Self {
      storage,
      network,
      active,
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      timeout,
      offline_url,
    }
  }

  /// Resolve a GET request with the strategy of its route.
  pub async fn handle(&self, request: &Request, policy: &RoutePolicy) -> Served {
    debug!(url = %request.url, strategy = %policy.strategy, "Handling fetch");
    match policy.strategy {
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request, policy.ttl()).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Network first, falling back to the cache and then to the offline
  /// response.
  async fn network_first(&self, request: &Request) -> Served {
    match self.resolve(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");
        match self.lookup(&RequestKey::from_request(request)) {
          Some(entry) => Served::from_cache(&entry),
          None => self.offline_response(request),
        }
      }
    }
  }

  /// Cache first; the network is only consulted on a miss or when the
  /// entry is older than the route's ttl.
  async fn cache_first(&self, request: &Request, ttl: Option<chrono::Duration>) -> Served {
    let cached = self.lookup(&RequestKey::from_request(request));

    if let Some(entry) = &cached {
      if ttl.map_or(true, |ttl| !entry.is_expired(ttl)) {
        return Served::from_cache(entry);
      }
      debug!(url = %request.url, "Cached entry expired, refetching");
    }

    match self.resolve(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Cache miss and network failed");
        match cached {
          // Offline mode: an expired entry beats no entry
          Some(entry) => Served::stale(&entry),
          None => self.offline_response(request),
        }
      }
    }
  }

  /// Serve whatever is cached right away and refresh the entry in the
  /// background. Only a miss waits on the network.
  async fn stale_while_revalidate(&self, request: &Request) -> Served {
    let cached = self.lookup(&RequestKey::from_request(request));
    let revalidation = self.resolve(request);

    if let Some(entry) = cached {
      return Served::from_cache(&entry);
    }

    match revalidation.await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "No cached entry and network failed");
        self.offline_response(request)
      }
    }
  }

  /// Start a network resolution for the request, or attach to the one
  /// already running for its key.
  ///
  /// The fetch runs as its own task, so it completes (and updates the
  /// store) even if every caller stops waiting. Callers get the response as
  /// soon as it arrives; the cache write follows.
  fn resolve(&self, request: &Request) -> Resolution {
    let key = RequestKey::from_request(request);
    let mut in_flight = lock(&self.in_flight);

    if let Some(pending) = in_flight.get(&key) {
      debug!(key = %key, "Attaching to in-flight resolution");
      return pending.response.clone();
    }

    let (reply, received) = oneshot::channel();
    let layer = self.clone();
    let task_key = key.clone();
    let request = request.clone();
    let task = tokio::spawn(async move { layer.fetch_and_store(task_key, request, reply).await });

    let response = async move {
      received
        .await
        .unwrap_or_else(|e| Err(NetworkError::Aborted(e.to_string())))
    }
    .boxed()
    .shared();
    let finished = async move {
      if let Err(e) = task.await {
        warn!(error = %e, "Resolution task failed");
      }
    }
    .boxed()
    .shared();

    in_flight.insert(
      key,
      Pending {
        response: response.clone(),
        finished,
      },
    );
    response
  }

  async fn fetch_and_store(
    &self,
    key: RequestKey,
    request: Request,
    reply: oneshot::Sender<Result<Response, NetworkError>>,
  ) {
    let result = self.fetch_with_timeout(request).await;
    // Nobody waiting is fine, the write still happens
    let _ = reply.send(result.clone());

    match result {
      Ok(response) if response.is_success() => {
        let layer = self.clone();
        let write_key = key.clone();
        let written = tokio::task::spawn_blocking(move || layer.store(&write_key, &response)).await;
        if let Err(e) = written {
          warn!(key = %key, error = %e, "Cache write task failed");
        }
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "Not caching unsuccessful response");
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Network fetch failed");
      }
    }

    lock(&self.in_flight).remove(&key);
  }

  /// Fetch from the network, giving up after the configured timeout.
  ///
  /// Giving up stops the wait; it does not promise the origin never sees
  /// the request.
  pub async fn fetch_with_timeout(&self, request: Request) -> Result<Response, NetworkError> {
    match tokio::time::timeout(self.timeout, self.network.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(NetworkError::Timeout(self.timeout)),
    }
  }

  /// Look up a key in the active store. Storage errors count as a miss.
  pub fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    if !key.is_cacheable() {
      return None;
    }
    let store = self.active.get()?;

    match self.storage.get(&store, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  /// Write a response into the store that is active right now.
  ///
  /// Never fails the caller: a full store or a storage error only means the
  /// response is served without being cached.
  pub fn store(&self, key: &RequestKey, response: &Response) -> bool {
    if !key.is_cacheable() {
      return false;
    }
    let Some(store) = self.active.get() else {
      debug!(key = %key, "No active store, skipping cache write");
      return false;
    };

    let entry = CachedEntry::from_response(key.clone(), response);
    match self.storage.put(&store, &entry) {
      Ok(()) => true,
      Err(WorkerError::StorageExhausted { needed, quota }) => {
        warn!(key = %key, needed, quota, "Storage exhausted, serving without caching");
        false
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Failed to write cache entry");
        false
      }
    }
  }

  /// Offline page for navigations, synthetic 503 for everything else.
  fn offline_response(&self, request: &Request) -> Served {
    if !request.is_navigation() {
      return Served::synthetic(Response::service_unavailable());
    }

    let response = self
      .lookup(&RequestKey::get(self.offline_url.clone()))
      .map(|entry| entry.to_response())
      .unwrap_or_else(Response::offline_page);
    Served::offline_fallback(response)
  }

  #[cfg(test)]
  /// Number of keys with a network resolution underway.
  pub fn in_flight_count(&self) -> usize {
    lock(&self.in_flight).len()
  }

  /// Wait until every network resolution in flight has finished, cache
  /// writes included.
  pub async fn settle(&self) {
    loop {
      let pending: Vec<_> = lock(&self.in_flight)
        .values()
        .map(|p| p.finished.clone())
        .collect();
      if pending.is_empty() {
        return;
      }
      futures::future::join_all(pending).await;
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      active: self.active.clone(),
      in_flight: Arc::clone(&self.in_flight),
      timeout: self.timeout,
      offline_url: self.offline_url.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::db::Database;
  use crate::network::testing::FakeNetwork;
  use crate::network::RequestMode;
  use crate::route::RoutePolicy;

  const STORE: &str = "local-basket-v1";

  struct Harness {
    layer: CacheLayer<SqliteStorage, FakeNetwork>,
    storage: Arc<SqliteStorage>,
    network: Arc<FakeNetwork>,
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://basket.test{}", path)).unwrap()
  }

  fn harness_with(storage: SqliteStorage) -> Harness {
    let storage = Arc::new(storage);
    let network = Arc::new(FakeNetwork::new());
    let active = ActiveStore::default();
    storage.create_store(STORE).unwrap();
    active.set(STORE);

    let layer = CacheLayer::new(
      storage.clone(),
      network.clone(),
      active,
      Duration::from_millis(100),
      url("/offline"),
    );
    Harness {
      layer,
      storage,
      network,
    }
  }

  fn harness() -> Harness {
    harness_with(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())))
  }

  impl Harness {
    fn seed(&self, path: &str, body: &str) {
      let entry = CachedEntry::from_response(RequestKey::get(url(path)), &Response::new(200, body));
      self.storage.put(STORE, &entry).unwrap();
    }

    fn cached_body(&self, path: &str) -> Option<String> {
      self
        .storage
        .get(STORE, &RequestKey::get(url(path)))
        .unwrap()
        .map(|e| String::from_utf8(e.body).unwrap())
    }
  }

  fn policy(strategy: Strategy) -> RoutePolicy {
    RoutePolicy::new("/", strategy)
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let h = harness();
    h.seed("/static/js/app.js", "cached");
    h.network.respond(url("/static/js/app.js").as_str(), 200, "fresh");

    let served = h
      .layer
      .handle(&Request::get(url("/static/js/app.js")), &policy(Strategy::CacheFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text(), "cached");
    assert_eq!(h.network.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let h = harness();
    h.network.respond(url("/search").as_str(), 200, "search shell");

    let served = h
      .layer
      .handle(&Request::get(url("/search")), &policy(Strategy::CacheFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Network);
    h.layer.settle().await;
    assert_eq!(h.cached_body("/search").as_deref(), Some("search shell"));
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_is_refetched() {
    let h = harness();
    let mut entry =
      CachedEntry::from_response(RequestKey::get(url("/map")), &Response::new(200, "old map"));
    entry.stored_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.storage.put(STORE, &entry).unwrap();
    h.network.respond(url("/map").as_str(), 200, "new map");

    let ttl = policy(Strategy::CacheFirst).with_ttl_secs(3600);
    let served = h.layer.handle(&Request::get(url("/map")), &ttl).await;
    assert_eq!(served.response.text(), "new map");
    h.layer.settle().await;

    // Offline: the expired entry is still better than nothing
    let mut entry =
      CachedEntry::from_response(RequestKey::get(url("/map")), &Response::new(200, "old map"));
    entry.stored_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.storage.put(STORE, &entry).unwrap();
    h.network.fail(url("/map").as_str());

    let served = h.layer.handle(&Request::get(url("/map")), &ttl).await;
    assert_eq!(served.source, ResponseSource::Stale);
    assert_eq!(served.response.text(), "old map");
  }

  #[tokio::test]
  async fn test_network_first_success_updates_store() {
    let h = harness();
    h.seed("/api/shops", "old");
    h.network.respond(url("/api/shops").as_str(), 200, "new");

    let served = h
      .layer
      .handle(&Request::get(url("/api/shops")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.text(), "new");
    h.layer.settle().await;
    assert_eq!(h.cached_body("/api/shops").as_deref(), Some("new"));
  }

  #[tokio::test]
  async fn test_network_first_failure_serves_cache() {
    let h = harness();
    h.seed("/shop/7", "cached shop");
    h.network.fail(url("/shop/7").as_str());

    let served = h
      .layer
      .handle(&Request::navigate(url("/shop/7")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text(), "cached shop");
  }

  #[tokio::test]
  async fn test_network_first_timeout_serves_cache() {
    let h = harness();
    h.seed("/api/shops", "cached");
    h.network.hang(url("/api/shops").as_str());

    let served = h
      .layer
      .handle(&Request::get(url("/api/shops")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Cache);
    h.layer.settle().await;
    assert_eq!(h.layer.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_precached_offline_page() {
    let h = harness();
    h.seed("/offline", "<h1>offline</h1>");
    h.network.fail(url("/shop/42").as_str());

    let served = h
      .layer
      .handle(&Request::navigate(url("/shop/42")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.text(), "<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_offline_page_uses_builtin() {
    let h = harness();
    h.network.fail(url("/shop/42").as_str());

    let served = h
      .layer
      .handle(&Request::navigate(url("/shop/42")), &policy(Strategy::CacheFirst))
      .await;

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.status, 503);
    assert!(served.response.text().contains("offline"));
  }

  #[tokio::test]
  async fn test_offline_non_navigation_gets_503() {
    let h = harness();
    h.seed("/offline", "<h1>offline</h1>");
    h.network.fail(url("/api/shops").as_str());

    let request = Request::get(url("/api/shops")).with_mode(RequestMode::Cors);
    let served = h.layer.handle(&request, &policy(Strategy::NetworkFirst)).await;

    assert_eq!(served.source, ResponseSource::Synthetic);
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.text(), "Offline");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cache_then_updates() {
    let h = harness();
    h.seed("/", "old home");
    h.network.respond(url("/").as_str(), 200, "new home");
    h.network.set_delay(Duration::from_millis(20));

    let first = h
      .layer
      .handle(&Request::get(url("/")), &policy(Strategy::StaleWhileRevalidate))
      .await;
    assert_eq!(first.source, ResponseSource::Cache);
    assert_eq!(first.response.text(), "old home");

    h.layer.settle().await;
    assert_eq!(h.network.calls_to(url("/").as_str()), 1);

    let second = h
      .layer
      .handle(&Request::get(url("/")), &policy(Strategy::StaleWhileRevalidate))
      .await;
    assert_eq!(second.response.text(), "new home");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let h = harness();
    h.network.respond(url("/about").as_str(), 200, "about");

    let served = h
      .layer
      .handle(&Request::get(url("/about")), &policy(Strategy::StaleWhileRevalidate))
      .await;

    assert_eq!(served.source, ResponseSource::Network);
    h.layer.settle().await;
    assert_eq!(h.cached_body("/about").as_deref(), Some("about"));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_offline_navigation_gets_offline_page() {
    let h = harness();
    h.seed("/offline", "<h1>offline</h1>");
    h.network.fail(url("/about").as_str());

    let served = h
      .layer
      .handle(&Request::navigate(url("/about")), &policy(Strategy::StaleWhileRevalidate))
      .await;

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.text(), "<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_offline_subresource_gets_503() {
    let h = harness();
    h.seed("/offline", "<h1>offline</h1>");
    h.network.fail(url("/static/css/main.css").as_str());

    let request = Request::get(url("/static/css/main.css")).with_mode(RequestMode::Cors);
    let served = h
      .layer
      .handle(&request, &policy(Strategy::StaleWhileRevalidate))
      .await;

    assert_eq!(served.source, ResponseSource::Synthetic);
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.text(), "Offline");
  }

  #[tokio::test]
  async fn test_concurrent_requests_share_one_fetch() {
    let h = harness();
    h.network.respond(url("/api/shops").as_str(), 200, "shops");
    h.network.set_delay(Duration::from_millis(30));

    let request = Request::get(url("/api/shops"));
    let network_first = policy(Strategy::NetworkFirst);
    let (a, b) = tokio::join!(
      h.layer.handle(&request, &network_first),
      h.layer.handle(&request, &network_first)
    );

    assert_eq!(h.network.calls_to(url("/api/shops").as_str()), 1);
    assert_eq!(a.response, b.response);
    assert_eq!(a.response.text(), "shops");
    h.layer.settle().await;
    assert_eq!(h.layer.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_unsuccessful_response_is_returned_but_not_cached() {
    let h = harness();
    h.network.respond(url("/product/9").as_str(), 404, "missing");

    let served = h
      .layer
      .handle(&Request::get(url("/product/9")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.status, 404);
    assert!(h.cached_body("/product/9").is_none());
  }

  #[tokio::test]
  async fn test_storage_exhausted_still_serves_response() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let h = harness_with(SqliteStorage::new(db).with_quota(Some(4)));
    h.network.respond(url("/api/shops").as_str(), 200, "far too large");

    let served = h
      .layer
      .handle(&Request::get(url("/api/shops")), &policy(Strategy::NetworkFirst))
      .await;

    assert_eq!(served.response.text(), "far too large");
    h.layer.settle().await;
    assert!(h.cached_body("/api/shops").is_none());
  }

  /// Storage whose writes take a while.
  struct SlowWrites {
    inner: SqliteStorage,
    delay: Duration,
  }

  impl CacheStorage for SlowWrites {
    fn create_store(&self, name: &str) -> crate::error::Result<()> {
      self.inner.create_store(name)
    }

    fn get(&self, store: &str, key: &RequestKey) -> crate::error::Result<Option<CachedEntry>> {
      self.inner.get(store, key)
    }

    fn put(&self, store: &str, entry: &CachedEntry) -> crate::error::Result<()> {
      std::thread::sleep(self.delay);
      self.inner.put(store, entry)
    }

    fn put_all(&self, store: &str, entries: &[CachedEntry]) -> crate::error::Result<()> {
      std::thread::sleep(self.delay);
      self.inner.put_all(store, entries)
    }

    fn delete_store(&self, name: &str) -> crate::error::Result<bool> {
      self.inner.delete_store(name)
    }

    fn list_store_names(&self) -> crate::error::Result<Vec<String>> {
      self.inner.list_store_names()
    }

    fn entry_count(&self, store: &str) -> crate::error::Result<usize> {
      self.inner.entry_count(store)
    }

    fn active_store(&self) -> crate::error::Result<Option<String>> {
      self.inner.active_store()
    }

    fn set_active_store(&self, name: &str) -> crate::error::Result<()> {
      self.inner.set_active_store(name)
    }

    fn installed_store(&self) -> crate::error::Result<Option<String>> {
      self.inner.installed_store()
    }

    fn set_installed_store(&self, name: &str) -> crate::error::Result<()> {
      self.inner.set_installed_store(name)
    }
  }

  #[tokio::test]
  async fn test_response_does_not_wait_for_cache_write() {
    let storage = Arc::new(SlowWrites {
      inner: SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())),
      delay: Duration::from_millis(500),
    });
    let network = Arc::new(FakeNetwork::new());
    let active = ActiveStore::default();
    storage.create_store(STORE).unwrap();
    active.set(STORE);
    network.respond(url("/api/shops").as_str(), 200, "shops");

    let layer = CacheLayer::new(
      storage.clone(),
      network,
      active,
      Duration::from_millis(100),
      url("/offline"),
    );

    let started = tokio::time::Instant::now();
    let served = layer
      .handle(&Request::get(url("/api/shops")), &policy(Strategy::NetworkFirst))
      .await;
    assert_eq!(served.response.text(), "shops");
    assert!(started.elapsed() < Duration::from_millis(250));

    layer.settle().await;
    assert!(started.elapsed() >= Duration::from_millis(500));
    let key = RequestKey::get(url("/api/shops"));
    assert_eq!(storage.get(STORE, &key).unwrap().unwrap().body, b"shops");
  }
}
