//! The worker context and its event dispatch.
//!
//! Everything the worker owns is built once in [`Worker::new`] and every
//! event the host delivers goes through [`Worker::dispatch`]. Dispatch never
//! fails: each event resolves to an [`Outcome`], degraded if need be.

use reqwest::Method;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{ActiveStore, CacheLayer, CacheStorage, RequestKey, Served, SqliteStorage};
use crate::clients::{Clients, LogHost, Notifier};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result as WorkerResult;
use crate::lifecycle::{ControlMessage, ControlReply, Lifecycle};
use crate::network::{HttpNetwork, Network, Request, Response};
use crate::notify::{NotificationDispatcher, NotificationId, NotificationState};
use crate::route::RouteTable;
use crate::sync::{DrainReport, PendingSyncItem, SyncPayload, SyncQueue};

/// Something the host asks the worker to handle.
#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  /// A request intercepted on its way out of a page
  Fetch(Request),
  /// Connectivity came back for a registered sync tag
  Sync { tag: String },
  PeriodicSync { tag: String },
  /// Raw push message data
  Push(Vec<u8>),
  NotificationClick {
    id: NotificationId,
    action: Option<String>,
  },
  NotificationClose { id: NotificationId },
  Message(ControlMessage),
}

impl Event {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch(_) => "fetch",
      Self::Sync { .. } => "sync",
      Self::PeriodicSync { .. } => "periodic-sync",
      Self::Push(_) => "push",
      Self::NotificationClick { .. } => "notification-click",
      Self::NotificationClose { .. } => "notification-close",
      Self::Message(_) => "message",
    }
  }
}

/// How an event was handled.
#[derive(Debug, Clone)]
pub enum Outcome {
  Done,
  /// Answer to a fetch
  Response(Served),
  /// The request is not ours to handle; the page goes to the network itself
  Passthrough,
  Reply(ControlReply),
  Drained(DrainReport),
  /// Number of entries a periodic refresh wrote
  Refreshed(usize),
  Notified(NotificationId),
  Navigated(String),
  Ignored(String),
  Failed(String),
}

impl Outcome {
  /// One-line JSON form, as written by `run`.
  pub fn to_json(&self) -> Value {
    match self {
      Self::Done => json!({ "outcome": "done" }),
      Self::Response(served) => json!({
        "outcome": "response",
        "source": served.source.to_string(),
        "status": served.response.status,
        "headers": served.response.headers,
        "body": served.response.text(),
        "stored_at": served.stored_at.map(|t| t.to_rfc3339()),
      }),
      Self::Passthrough => json!({ "outcome": "passthrough" }),
      Self::Reply(reply) => json!({ "outcome": "reply", "reply": reply }),
      Self::Drained(report) => json!({
        "outcome": "drained",
        "replayed": report.replayed,
        "failed": report.failed,
        "dropped": report.dropped,
      }),
      Self::Refreshed(count) => json!({ "outcome": "refreshed", "entries": count }),
      Self::Notified(id) => json!({ "outcome": "notified", "id": id }),
      Self::Navigated(url) => json!({ "outcome": "navigated", "url": url }),
      Self::Ignored(reason) => json!({ "outcome": "ignored", "reason": reason }),
      Self::Failed(reason) => json!({ "outcome": "failed", "reason": reason }),
    }
  }
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Done => write!(f, "ok"),
      Self::Response(served) => {
        let response = &served.response;
        writeln!(f, "{} {} ({})", response.status, response.status_text, served.source)?;
        write!(f, "{}", response.text())
      }
      Self::Passthrough => write!(f, "passthrough"),
      Self::Reply(reply) => match serde_json::to_string(reply) {
        Ok(reply) => write!(f, "{}", reply),
        Err(_) => write!(f, "{:?}", reply),
      },
      Self::Drained(report) => write!(
        f,
        "replayed {}, failed {}, dropped {}",
        report.replayed, report.failed, report.dropped
      ),
      Self::Refreshed(count) => write!(f, "refreshed {} entries", count),
      Self::Notified(id) => write!(f, "notification {} displayed", id),
      Self::Navigated(url) => write!(f, "opened {}", url),
      Self::Ignored(reason) => write!(f, "ignored: {}", reason),
      Self::Failed(reason) => write!(f, "failed: {}", reason),
    }
  }
}

/// The running worker.
pub struct Worker<S: CacheStorage = SqliteStorage, N: Network = HttpNetwork> {
  config: Config,
  routes: RouteTable,
  active: ActiveStore,
  layer: CacheLayer<S, N>,
  lifecycle: Lifecycle<S, N>,
  sync: SyncQueue,
  notifications: NotificationDispatcher,
  network: Arc<N>,
}

impl Worker {
  /// Open the on-disk database and real network described by `config`.
  pub fn open(config: Config) -> color_eyre::Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let storage = Arc::new(SqliteStorage::new(db.clone()).with_quota(config.storage.quota_bytes));
    let network = Arc::new(HttpNetwork::new(config.network_timeout())?);
    let host = Arc::new(LogHost);

    Self::new(config, db, storage, network, host.clone(), host)
  }
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(
    config: Config,
    db: Arc<Database>,
    storage: Arc<S>,
    network: Arc<N>,
    clients: Arc<dyn Clients>,
    notifier: Arc<dyn Notifier>,
  ) -> color_eyre::Result<Self> {
    let active = ActiveStore::default();
    let layer = CacheLayer::new(
      storage.clone(),
      network.clone(),
      active.clone(),
      config.network_timeout(),
      config.offline_url()?,
    );

    let lifecycle = Lifecycle::new(
      config.store_name(),
      config.precache_urls()?,
      storage,
      layer.clone(),
      clients.clone(),
      active.clone(),
      config.skip_waiting,
    );
    lifecycle.restore()?;

    let sync = SyncQueue::new(db, config.sync.max_attempts);
    let notifications =
      NotificationDispatcher::new(config.notifications.clone(), notifier, clients);

    Ok(Self {
      routes: config.route_table(),
      config,
      active,
      layer,
      lifecycle,
      sync,
      notifications,
      network,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Version answering requests, as reported to pages.
  pub fn version(&self) -> String {
    self.lifecycle.version()
  }

  pub fn pending_writes(&self) -> WorkerResult<Vec<PendingSyncItem>> {
    self.sync.pending()
  }

  /// Number of writes waiting for the next sync.
  pub fn queued_writes(&self) -> WorkerResult<usize> {
    self.sync.len()
  }

  /// Wait for background revalidations to finish writing.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }

  pub async fn dispatch(&self, event: Event) -> Outcome {
    debug!(event = event.name(), "Dispatching event");

    match event {
      Event::Install => match self.lifecycle.install().await {
        Ok(()) => Outcome::Done,
        Err(e) => Outcome::Failed(e.to_string()),
      },
      Event::Activate => match self.lifecycle.activate().await {
        Ok(()) => Outcome::Done,
        Err(e) => Outcome::Failed(e.to_string()),
      },
      Event::Fetch(request) => self.handle_fetch(request).await,
      Event::Sync { tag } => self.handle_sync(&tag).await,
      Event::PeriodicSync { tag } => {
        if tag != self.config.periodic.tag {
          return Outcome::Ignored(format!("unknown periodic sync tag {}", tag));
        }
        Outcome::Refreshed(self.refresh_feed().await)
      }
      Event::Push(data) => match self.notifications.on_push(&data) {
        Some(id) => Outcome::Notified(id),
        None => Outcome::Ignored("malformed push payload".to_string()),
      },
      Event::NotificationClick { id, action } => {
        Outcome::Navigated(self.notifications.on_click(id, action.as_deref()))
      }
      Event::NotificationClose { id } => {
        if self.notifications.on_close(id) {
          return Outcome::Done;
        }
        match self.notifications.state(id) {
          Some(NotificationState::Closed) => Outcome::Ignored(format!("notification {} is already closed", id)),
          _ => Outcome::Ignored(format!("unknown notification {}", id)),
        }
      }
      Event::Message(message) => match self.lifecycle.on_message(message).await {
        Some(reply) => Outcome::Reply(reply),
        None => Outcome::Done,
      },
    }
  }

  async fn handle_fetch(&self, request: Request) -> Outcome {
    if !request.is_fetchable() {
      return Outcome::Passthrough;
    }
    if request.method != Method::GET {
      return Outcome::Response(self.handle_write(request).await);
    }
    if self.active.get().is_none() {
      debug!(url = %request.url, "No active version, passing through");
      return Outcome::Passthrough;
    }

    let policy = self.routes.resolve(&request.url);
    let served = self.layer.handle(&request, policy).await;
    info!(
      method = %request.method,
      url = %request.url,
      strategy = %policy.strategy,
      source = %served.source,
      status = served.response.status,
      "Served fetch"
    );
    Outcome::Response(served)
  }

  /// Send a write to the origin, queueing it for background sync if the
  /// origin cannot be reached.
  async fn handle_write(&self, request: Request) -> Served {
    let payload = SyncPayload::from_request(&request);

    match self.layer.fetch_with_timeout(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(method = %payload.method, url = %payload.url, error = %e, "Write failed, queueing");
        match self.sync.enqueue(&payload) {
          Ok(id) => Served::synthetic(Response::queued(id)),
          Err(e) => {
            warn!(url = %payload.url, error = %e, "Failed to queue write");
            Served::synthetic(Response::service_unavailable())
          }
        }
      }
    }
  }

  async fn handle_sync(&self, tag: &str) -> Outcome {
    if tag != self.config.sync.tag {
      return Outcome::Ignored(format!("unknown sync tag {}", tag));
    }

    match self.sync.drain(self.network.as_ref(), self.config.network_timeout()).await {
      Ok(report) => Outcome::Drained(report),
      Err(e) => {
        warn!(error = %e, "Background sync failed");
        Outcome::Failed(e.to_string())
      }
    }
  }

  /// Fetch the updates feed and cache every record at its own path.
  ///
  /// Any failure is logged and the refresh writes nothing further.
  async fn refresh_feed(&self) -> usize {
    let periodic = &self.config.periodic;
    let feed_url = match self.config.resolve_url(&periodic.feed_url) {
      Ok(url) => url,
      Err(e) => {
        warn!(error = %e, "Invalid feed URL");
        return 0;
      }
    };

    let response = match self.layer.fetch_with_timeout(Request::get(feed_url.clone())).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        warn!(url = %feed_url, status = response.status, "Feed refresh failed");
        return 0;
      }
      Err(e) => {
        warn!(url = %feed_url, error = %e, "Feed refresh failed");
        return 0;
      }
    };

    let records: Vec<Value> = match serde_json::from_slice(&response.body) {
      Ok(records) => records,
      Err(e) => {
        warn!(url = %feed_url, error = %e, "Feed is not a JSON array");
        return 0;
      }
    };

    let mut written = 0;
    for record in &records {
      let id = match record.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => {
          debug!("Skipping feed record without id");
          continue;
        }
      };

      let path = periodic.cache_path.replace("{id}", &id);
      let url = match self.config.resolve_url(&path) {
        Ok(url) => url,
        Err(e) => {
          warn!(path, error = %e, "Skipping feed record");
          continue;
        }
      };

      let body = record.to_string();
      let response = Response::new(200, body).with_header("content-type", "application/json");
      if self.layer.store(&RequestKey::get(url), &response) {
        written += 1;
      }
    }

    info!(records = records.len(), written, "Feed refreshed");
    written
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use crate::clients::testing::{HostEvent, RecordingHost};
  use crate::network::testing::FakeNetwork;
  use url::Url;

  struct Harness {
    worker: Worker<SqliteStorage, FakeNetwork>,
    network: Arc<FakeNetwork>,
    host: Arc<RecordingHost>,
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://basket.test{}", path)).unwrap()
  }

  fn harness() -> Harness {
    let config = Config::from_yaml("origin: https://basket.test\n").unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let network = Arc::new(FakeNetwork::new());
    let host = Arc::new(RecordingHost::default());

    for path in &config.precache {
      network.respond(url(path).as_str(), 200, &format!("precached {}", path));
    }

    let worker = Worker::new(config, db, storage, network.clone(), host.clone(), host.clone()).unwrap();
    Harness {
      worker,
      network,
      host,
    }
  }

  async fn installed() -> Harness {
    let h = harness();
    assert!(matches!(h.worker.dispatch(Event::Install).await, Outcome::Done));
    h
  }

  fn served(outcome: Outcome) -> Served {
    match outcome {
      Outcome::Response(served) => served,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_fetch_passes_through_before_activation() {
    let h = harness();
    let outcome = h.worker.dispatch(Event::Fetch(Request::get(url("/static/js/app.js")))).await;
    assert!(matches!(outcome, Outcome::Passthrough));
  }

  #[tokio::test]
  async fn test_non_http_requests_pass_through() {
    let h = installed().await;
    let request = Request::get(Url::parse("chrome-extension://abcdef/popup.html").unwrap());
    assert!(matches!(h.worker.dispatch(Event::Fetch(request)).await, Outcome::Passthrough));
  }

  #[tokio::test]
  async fn test_install_activates_and_claims() {
    let h = installed().await;
    assert_eq!(h.worker.version(), "local-basket-v1");
    assert_eq!(h.host.events(), vec![HostEvent::Claimed]);
  }

  #[tokio::test]
  async fn test_offline_navigation_to_uncached_shop_gets_offline_page() {
    let h = installed().await;
    h.network.fail(url("/shop/42").as_str());

    let served = served(h.worker.dispatch(Event::Fetch(Request::navigate(url("/shop/42")))).await);
    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response.text(), "precached /offline");
  }

  #[tokio::test]
  async fn test_precached_asset_is_served_offline() {
    let h = installed().await;
    h.network.fail(url("/static/js/app.js").as_str());

    let served = served(h.worker.dispatch(Event::Fetch(Request::get(url("/static/js/app.js")))).await);
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.text(), "precached /static/js/app.js");
  }

  #[tokio::test]
  async fn test_failed_write_is_queued_and_replayed_on_sync() {
    let h = installed().await;
    h.network.fail(url("/review/add").as_str());

    let request = Request::new(Method::POST, url("/review/add")).with_body(r#"{"rating":5}"#);
    let served = served(h.worker.dispatch(Event::Fetch(request)).await);
    assert_eq!(served.source, ResponseSource::Synthetic);
    assert_eq!(served.response.status, 202);

    assert_eq!(h.worker.queued_writes().unwrap(), 1);
    let pending = h.worker.pending_writes().unwrap();
    assert_eq!(pending[0].payload.body.as_deref(), Some(&br#"{"rating":5}"#[..]));

    let ignored = h.worker.dispatch(Event::Sync { tag: "other".into() }).await;
    assert!(matches!(ignored, Outcome::Ignored(_)));

    h.network.respond(url("/review/add").as_str(), 201, "created");
    let outcome = h
      .worker
      .dispatch(Event::Sync {
        tag: "background-sync".into(),
      })
      .await;
    assert!(matches!(outcome, Outcome::Drained(DrainReport { replayed: 1, .. })));
    assert_eq!(h.worker.queued_writes().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_successful_write_is_not_queued() {
    let h = installed().await;
    h.network.respond(url("/review/add").as_str(), 201, "created");

    let request = Request::new(Method::POST, url("/review/add"));
    let served = served(h.worker.dispatch(Event::Fetch(request)).await);
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response.status, 201);
    assert!(h.worker.pending_writes().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_get_version_message() {
    let h = installed().await;
    let outcome = h.worker.dispatch(Event::Message(ControlMessage::GetVersion)).await;
    assert_eq!(
      outcome.to_json(),
      json!({ "outcome": "reply", "reply": { "type": "VERSION", "version": "local-basket-v1" } })
    );
  }

  #[tokio::test]
  async fn test_periodic_refresh_caches_feed_records() {
    let h = installed().await;
    h.network.respond(
      url("/api/shops/updates").as_str(),
      200,
      r#"[{"id":7,"name":"Corner Bakery"},{"id":"8","name":"Green Grocer"},{"name":"no id"}]"#,
    );

    let outcome = h
      .worker
      .dispatch(Event::PeriodicSync {
        tag: "shop-updates".into(),
      })
      .await;
    assert!(matches!(outcome, Outcome::Refreshed(2)));

    h.network.fail(url("/shop/7").as_str());
    let served = served(h.worker.dispatch(Event::Fetch(Request::get(url("/shop/7")))).await);
    assert_eq!(served.source, ResponseSource::Cache);
    assert!(served.response.text().contains("Corner Bakery"));
  }

  #[tokio::test]
  async fn test_periodic_refresh_failure_writes_nothing() {
    let h = installed().await;
    h.network.fail(url("/api/shops/updates").as_str());

    let outcome = h
      .worker
      .dispatch(Event::PeriodicSync {
        tag: "shop-updates".into(),
      })
      .await;
    assert!(matches!(outcome, Outcome::Refreshed(0)));
  }

  #[tokio::test]
  async fn test_push_then_click_opens_shop() {
    let h = harness();
    let payload = br#"{"title":"New stock","body":"Fresh bread","data":{"shopUrl":"/shop/42"}}"#;

    let id = match h.worker.dispatch(Event::Push(payload.to_vec())).await {
      Outcome::Notified(id) => id,
      other => panic!("expected a notification, got {:?}", other),
    };

    let outcome = h
      .worker
      .dispatch(Event::NotificationClick {
        id,
        action: Some("open_shop".into()),
      })
      .await;
    assert!(matches!(outcome, Outcome::Navigated(ref url) if url == "/shop/42"));
    assert!(h.host.events().contains(&HostEvent::Opened("/shop/42".into())));

    let outcome = h.worker.dispatch(Event::NotificationClose { id }).await;
    assert!(matches!(outcome, Outcome::Ignored(ref reason) if reason.contains("already closed")));

    let outcome = h.worker.dispatch(Event::NotificationClose { id: 99 }).await;
    assert!(matches!(outcome, Outcome::Ignored(ref reason) if reason.contains("unknown")));
  }

  #[tokio::test]
  async fn test_malformed_push_is_ignored() {
    let h = harness();
    let outcome = h.worker.dispatch(Event::Push(b"{}".to_vec())).await;
    assert!(matches!(outcome, Outcome::Ignored(_)));
    assert!(h.host.events().is_empty());
  }
}
