use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::lifecycle::ControlMessage;
use crate::network::{Request, RequestMode};
use crate::notify::NotificationId;
use crate::worker::Event;

/// An event as written on one input line, tagged by `event`.
///
/// ```json
/// {"event":"fetch","url":"/shop/42","mode":"navigate"}
/// {"event":"sync"}
/// {"event":"message","data":{"type":"GET_VERSION"}}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WireEvent {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    mode: Option<RequestMode>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
  },
  /// Without a tag the configured background sync tag is used
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  PeriodicSync {
    #[serde(default)]
    tag: Option<String>,
  },
  /// Push data, either a JSON object or a string holding one
  Push { data: Value },
  NotificationClick {
    id: NotificationId,
    #[serde(default)]
    action: Option<String>,
  },
  NotificationClose { id: NotificationId },
  Message { data: ControlMessage },
}

impl WireEvent {
  pub fn into_event(self, config: &Config) -> Result<Event> {
    let event = match self {
      Self::Install => Event::Install,
      Self::Activate => Event::Activate,
      Self::Fetch {
        url,
        method,
        mode,
        headers,
        body,
      } => {
        let mut request = build_request(config, &url, method.as_deref(), body)?;
        request.mode = mode;
        request.headers = headers.into_iter().collect();
        Event::Fetch(request)
      }
      Self::Sync { tag } => Event::Sync {
        tag: tag.unwrap_or_else(|| config.sync.tag.clone()),
      },
      Self::PeriodicSync { tag } => Event::PeriodicSync {
        tag: tag.unwrap_or_else(|| config.periodic.tag.clone()),
      },
      Self::Push { data } => {
        let bytes = match data {
          Value::String(raw) => raw.into_bytes(),
          other => serde_json::to_vec(&other)?,
        };
        Event::Push(bytes)
      }
      Self::NotificationClick { id, action } => Event::NotificationClick { id, action },
      Self::NotificationClose { id } => Event::NotificationClose { id },
      Self::Message { data } => Event::Message(data),
    };
    Ok(event)
  }
}

/// Build a request for a path (or absolute URL) on the configured origin.
pub fn build_request(
  config: &Config,
  url: &str,
  method: Option<&str>,
  body: Option<String>,
) -> Result<Request> {
  let url = config.resolve_url(url)?;
  let method = match method {
    Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", m, e))?,
    None => Method::GET,
  };

  let mut request = Request::new(method, url);
  request.body = body.map(String::into_bytes);
  Ok(request)
}

/// One line of input.
#[derive(Debug)]
pub enum Input {
  Event(WireEvent),
  /// A line that is not a valid event
  Invalid { line: String, error: String },
}

/// Reads newline-delimited JSON events on a background task.
pub struct EventReader {
  rx: mpsc::UnboundedReceiver<Input>,
}

impl EventReader {
  pub fn stdin() -> Self {
    Self::new(tokio::io::stdin())
  }

  pub fn new<R>(reader: R) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = BufReader::new(reader).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
          continue;
        }

        let input = match serde_json::from_str::<WireEvent>(line) {
          Ok(event) => Input::Event(event),
          Err(e) => Input::Invalid {
            line: line.to_string(),
            error: e.to_string(),
          },
        };
        if tx.send(input).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Next input line; `None` at end of input.
  pub async fn next(&mut self) -> Option<Input> {
    self.rx.recv().await
  }
}
