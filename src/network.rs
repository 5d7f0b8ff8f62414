//! The network boundary: requests as the worker sees them, responses, and
//! the `Network` trait the strategies fetch through.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Why a network fetch produced no response.
///
/// Clone so a single failed resolution can be handed to every caller that
/// attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("connection failed: {0}")]
  Connection(String),

  #[error("fetch task aborted: {0}")]
  Aborted(String),
}

/// Request mode as reported by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation (expects an HTML document)
  Navigate,
  SameOrigin,
  Cors,
  NoCors,
}

/// An outgoing request observed at the fetch-interception boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// `None` when the page did not say; navigation is then inferred from `Accept`.
  pub mode: Option<RequestMode>,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: None,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET issued by a top-level page navigation.
  #[cfg(test)]
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_mode(RequestMode::Navigate)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = Some(mode);
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  #[cfg(test)]
  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether this request expects an HTML page.
  ///
  /// An explicit mode wins. Without one, an `Accept` header that lists
  /// `text/html` classifies the request as a navigation.
  pub fn is_navigation(&self) -> bool {
    match self.mode {
      Some(RequestMode::Navigate) => true,
      Some(_) => false,
      None => self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html")),
    }
  }

  /// Only http(s) requests reach the network; anything else (extension
  /// URIs, data URLs) is left alone.
  pub fn is_fetchable(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// A response from the origin, the cache, or synthesized by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

/// Page served for navigations when neither cache nor network can help and
/// the precached offline page is missing too.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available without a connection.</p></body></html>\n";

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("")
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx, the only responses worth caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  /// Synthetic 503 for non-navigation requests that cannot be served.
  pub fn service_unavailable() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  /// Built-in offline document.
  pub fn offline_page() -> Self {
    Self::new(503, OFFLINE_PAGE).with_header("content-type", "text/html; charset=utf-8")
  }

  /// Reply for a write that was queued for later replay.
  pub fn queued(id: i64) -> Self {
    let body = serde_json::json!({ "queued": true, "id": id }).to_string();
    Self::new(202, body).with_header("content-type", "application/json")
  }
}

/// Something that can perform a network fetch.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// `Network` backed by a reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(connect_timeout: Duration) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .user_agent(concat!("basket-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| NetworkError::Connection(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    let mut builder = self.client.request(request.method, request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| NetworkError::Connection(e.to_string()))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Connection(e.to_string()))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}
