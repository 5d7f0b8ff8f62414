use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::route::{default_routes, RouteTable, RoutePolicy, Strategy};

/// Directory name under the platform config/data dirs
const APP_DIR: &str = "basket-sw";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application name; the store name is `<app>-v<version>`
  pub app: String,
  pub version: u32,
  /// Origin every relative path is resolved against
  pub origin: String,
  /// Page served to navigations when both cache and network fail
  pub offline_url: String,
  /// Paths that must be cached for an install to succeed
  pub precache: Vec<String>,
  /// Ordered route bindings; first match wins
  pub routes: Vec<RoutePolicy>,
  pub default_strategy: Strategy,
  pub network_timeout_ms: u64,
  /// Activate right after a successful install instead of waiting
  pub skip_waiting: bool,
  pub storage: StorageConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub periodic: PeriodicConfig,
  /// Directory for the rolling log file (defaults to the data dir)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to `$XDG_DATA_HOME/basket-sw/worker.db`)
  pub path: Option<PathBuf>,
  /// Upper bound on cached body bytes; unlimited when unset
  pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Sync tag that triggers a queue drain
  pub tag: String,
  /// Failed replays after which an item is dropped
  pub max_attempts: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "background-sync".to_string(),
      max_attempts: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// URL opened when a click has no more specific target
  pub root_url: String,
  /// Action id → field of the notification `data` holding its target URL
  pub action_targets: BTreeMap<String, String>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: "/static/icons/icon-192x192.png".to_string(),
      badge: "/static/icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
      root_url: "/".to_string(),
      action_targets: BTreeMap::from([("open_shop".to_string(), "shopUrl".to_string())]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
  /// Periodic sync tag that triggers a feed refresh
  pub tag: String,
  /// JSON array of updated records
  pub feed_url: String,
  /// Where each record is cached; `{id}` is replaced by the record id
  pub cache_path: String,
}

impl Default for PeriodicConfig {
  fn default() -> Self {
    Self {
      tag: "shop-updates".to_string(),
      feed_url: "/api/shops/updates".to_string(),
      cache_path: "/shop/{id}".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app: "local-basket".to_string(),
      version: 1,
      origin: "http://localhost:5000".to_string(),
      offline_url: "/offline".to_string(),
      precache: [
        "/",
        "/static/css/main.css",
        "/static/js/app.js",
        "/static/js/utils.js",
        "/static/js/geolocation.js",
        "/static/js/map.js",
        "/static/js/forms.js",
        "/static/manifest.json",
        "/offline",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      routes: default_routes(),
      default_strategy: Strategy::StaleWhileRevalidate,
      network_timeout_ms: 10_000,
      skip_waiting: true,
      storage: StorageConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      periodic: PeriodicConfig::default(),
      log_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./basket-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/basket-sw/config.yaml
  ///
  /// Without any file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("basket-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject configurations the worker cannot run with.
  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http(s): {}", self.origin));
    }
    if self.app.trim().is_empty() {
      return Err(eyre!("App name must not be empty"));
    }
    self.offline_url()?;
    self.precache_urls()?;
    Ok(())
  }

  /// Name of the cache store this configuration installs.
  pub fn store_name(&self) -> String {
    format!("{}-v{}", self.app, self.version)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve_url(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }

  pub fn offline_url(&self) -> Result<Url> {
    self.resolve_url(&self.offline_url)
  }

  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|p| self.resolve_url(p)).collect()
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }

  pub fn route_table(&self) -> RouteTable {
    RouteTable::new(self.routes.clone(), self.default_strategy)
  }

  fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_DIR))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("worker.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_describe_local_basket() {
    let config = Config::default();
    config.validate().unwrap();

    assert_eq!(config.store_name(), "local-basket-v1");
    assert_eq!(config.precache.len(), 9);
    assert!(config.precache.contains(&config.offline_url));
    assert_eq!(
      config.offline_url().unwrap().as_str(),
      "http://localhost:5000/offline"
    );
    assert_eq!(config.route_table().len(), 10);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
version: 3
origin: https://basket.example
network_timeout_ms: 2500
routes:
  - pattern: /api/
    strategy: network_first
  - pattern: /static/
    match: prefix
    strategy: cache_first
    ttl_secs: 86400
sync:
  max_attempts: 3
notifications:
  action_targets:
    open_product: productUrl
"#,
    )
    .unwrap();

    assert_eq!(config.store_name(), "local-basket-v3");
    assert_eq!(config.network_timeout(), Duration::from_millis(2500));
    assert_eq!(config.routes.len(), 2);
    assert_eq!(config.routes[1].ttl_secs, Some(86400));
    assert_eq!(config.sync.max_attempts, 3);
    assert_eq!(config.sync.tag, "background-sync");
    assert_eq!(config.notifications.icon, "/static/icons/icon-192x192.png");
    assert_eq!(
      config.notifications.action_targets.get("open_product").map(String::as_str),
      Some("productUrl")
    );
    assert_eq!(
      config.resolve_url("/shop/42").unwrap().as_str(),
      "https://basket.example/shop/42"
    );
  }

  #[test]
  fn test_rejects_bad_origin() {
    let config = Config::from_yaml("origin: ftp://basket.example\n").unwrap();
    assert!(config.validate().is_err());

    let config = Config::from_yaml("origin: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/basket-sw.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basket-sw.yaml");
    std::fs::write(&path, "app: corner-shop\nversion: 2\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.store_name(), "corner-shop-v2");
  }
}
