//! Route policy table: which caching strategy governs a request.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How a request is resolved between cache and network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Network with a bounded timeout, cache as fallback
  NetworkFirst,
  /// Cache hit never pays network latency
  CacheFirst,
  /// Serve cache now, refresh it in the background
  #[default]
  StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::NetworkFirst => "network-first",
      Self::CacheFirst => "cache-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    };
    f.write_str(name)
  }
}

/// How a pattern is compared against the request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
  /// Path starts with the pattern
  Prefix,
  /// Pattern appears anywhere in the path
  #[default]
  Contains,
}

/// A single pattern → strategy binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutePolicy {
  pub pattern: String,
  #[serde(default, rename = "match")]
  pub kind: MatchKind,
  pub strategy: Strategy,
  /// Maximum age of a cache hit for cache-first routes
  #[serde(default)]
  pub ttl_secs: Option<u64>,
}

impl RoutePolicy {
  pub fn new(pattern: &str, strategy: Strategy) -> Self {
    Self {
      pattern: pattern.to_string(),
      kind: MatchKind::Contains,
      strategy,
      ttl_secs: None,
    }
  }

  #[cfg(test)]
  pub fn prefix(mut self) -> Self {
    self.kind = MatchKind::Prefix;
    self
  }

  #[cfg(test)]
  pub fn with_ttl_secs(mut self, secs: u64) -> Self {
    self.ttl_secs = Some(secs);
    self
  }

  pub fn matches(&self, path: &str) -> bool {
    match self.kind {
      MatchKind::Prefix => path.starts_with(&self.pattern),
      MatchKind::Contains => path.contains(&self.pattern),
    }
  }

  pub fn ttl(&self) -> Option<Duration> {
    self
      .ttl_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .map(Duration::seconds)
  }
}

/// Ordered route list. First match wins; no match falls back to the default.
///
/// Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct RouteTable {
  routes: Vec<RoutePolicy>,
  fallback: RoutePolicy,
}

impl RouteTable {
  pub fn new(routes: Vec<RoutePolicy>, default_strategy: Strategy) -> Self {
    Self {
      routes,
      fallback: RoutePolicy::new("", default_strategy),
    }
  }

  /// Resolve the policy for a URL by a linear scan over its path.
  pub fn resolve(&self, url: &Url) -> &RoutePolicy {
    let path = url.path();
    self
      .routes
      .iter()
      .find(|route| route.matches(path))
      .unwrap_or(&self.fallback)
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.routes.len()
  }
}

/// The route list of the Local Basket app.
///
/// Volatile API and detail pages go network-first; static assets and the
/// search/map shells go cache-first. Network-first bindings are listed first
/// so they take precedence.
pub fn default_routes() -> Vec<RoutePolicy> {
  let network_first = ["/api/", "/shop/", "/product/", "/review"];
  let cache_first = [
    "/search",
    "/map",
    "/static/css/",
    "/static/js/",
    "/static/images/",
    "/static/icons/",
  ];

  network_first
    .iter()
    .map(|p| RoutePolicy::new(p, Strategy::NetworkFirst))
    .chain(
      cache_first
        .iter()
        .map(|p| RoutePolicy::new(p, Strategy::CacheFirst)),
    )
    .collect()
}
