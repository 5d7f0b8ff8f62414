//! Push notifications: payload parsing, display, and click routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clients::{Clients, Notifier};
use crate::config::NotificationConfig;
use crate::error::{Result, WorkerError};

pub type NotificationId = u64;

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  /// Page opened when this action is clicked
  #[serde(default)]
  pub url: Option<String>,
}

/// Push message as sent by the push service.
#[derive(Debug, Deserialize)]
struct RawPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  #[serde(default)]
  data: Value,
  #[serde(default)]
  actions: Vec<NotificationAction>,
}

/// A validated push payload with display defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Opaque data echoed back on click
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

impl NotificationPayload {
  /// Parse a push message. A payload without a title or body is malformed.
  pub fn parse(bytes: &[u8], defaults: &NotificationConfig) -> Result<Self> {
    let raw: RawPayload = serde_json::from_slice(bytes)
      .map_err(|e| WorkerError::MalformedPushPayload(e.to_string()))?;

    let title = raw
      .title
      .filter(|t| !t.trim().is_empty())
      .ok_or_else(|| WorkerError::MalformedPushPayload("missing title".into()))?;
    let body = raw
      .body
      .filter(|b| !b.trim().is_empty())
      .ok_or_else(|| WorkerError::MalformedPushPayload("missing body".into()))?;

    Ok(Self {
      title,
      body,
      icon: raw.icon.unwrap_or_else(|| defaults.icon.clone()),
      badge: raw.badge.unwrap_or_else(|| defaults.badge.clone()),
      vibrate: defaults.vibrate.clone(),
      data: raw.data,
      actions: raw.actions,
    })
  }
}

/// Where a notification is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
  Received,
  Displayed,
  Clicked,
  Dismissed,
  Closed,
}

#[derive(Debug, Clone)]
pub struct Notification {
  pub id: NotificationId,
  pub payload: NotificationPayload,
  pub state: NotificationState,
}

/// Turns push messages into notifications and clicks into navigation.
///
/// Notifications are kept in memory only while displayed.
pub struct NotificationDispatcher {
  config: NotificationConfig,
  notifier: Arc<dyn Notifier>,
  clients: Arc<dyn Clients>,
  displayed: Mutex<HashMap<NotificationId, Notification>>,
  next_id: AtomicU64,
}

impl NotificationDispatcher {
  pub fn new(
    config: NotificationConfig,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    Self {
      config,
      notifier,
      clients,
      displayed: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  /// Handle a push message. Malformed payloads are dropped and `None` is
  /// returned.
  pub fn on_push(&self, data: &[u8]) -> Option<NotificationId> {
    let payload = match NotificationPayload::parse(data, &self.config) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "Discarding push message");
        return None;
      }
    };

    let mut notification = Notification {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      payload,
      state: NotificationState::Received,
    };
    debug!(id = notification.id, "Push message received");

    self.notifier.show(&notification);
    notification.state = NotificationState::Displayed;

    let id = notification.id;
    self.with_displayed(|displayed| {
      displayed.insert(id, notification);
    });
    Some(id)
  }

  /// Handle a click on a notification or one of its actions.
  ///
  /// The notification is always closed. Returns the URL that was opened.
  pub fn on_click(&self, id: NotificationId, action: Option<&str>) -> String {
    let payload = self.transition(id, NotificationState::Clicked);
    self.close(id);

    let target = match payload {
      Some(payload) => self.target_url(&payload, action),
      None => {
        debug!(id, "Click on unknown notification, opening root");
        self.config.root_url.clone()
      }
    };

    info!(id, action, url = %target, "Notification clicked");
    self.clients.open_window(&target);
    target
  }

  /// Handle a notification dismissed without a click.
  pub fn on_close(&self, id: NotificationId) -> bool {
    if self.transition(id, NotificationState::Dismissed).is_none() {
      return false;
    }
    self.close(id);
    debug!(id, "Notification dismissed");
    true
  }

  /// Move a displayed notification to `state`, returning its payload.
  fn transition(&self, id: NotificationId, state: NotificationState) -> Option<NotificationPayload> {
    self.with_displayed(|displayed| {
      let notification = displayed.get_mut(&id)?;
      notification.state = state;
      Some(notification.payload.clone())
    })
  }

  /// Close on the platform and forget the notification.
  fn close(&self, id: NotificationId) {
    self.notifier.close(id);
    self.with_displayed(|displayed| displayed.remove(&id));
  }

  /// State of a notification; `None` for ids this dispatcher never issued.
  pub fn state(&self, id: NotificationId) -> Option<NotificationState> {
    let state = self.with_displayed(|displayed| displayed.get(&id).map(|n| n.state));
    match state {
      Some(state) => Some(state),
      None if id > 0 && id < self.next_id.load(Ordering::Relaxed) => Some(NotificationState::Closed),
      None => None,
    }
  }

  /// Pick the page to open for a click.
  ///
  /// 1. The clicked action's own URL
  /// 2. The `data` field configured for that action id
  /// 3. The application root
  fn target_url(&self, payload: &NotificationPayload, action: Option<&str>) -> String {
    let Some(action) = action.filter(|a| !a.is_empty()) else {
      return self.config.root_url.clone();
    };

    let own_url = payload
      .actions
      .iter()
      .find(|a| a.action == action)
      .and_then(|a| a.url.clone());

    own_url
      .or_else(|| {
        let field = self.config.action_targets.get(action)?;
        payload.data.get(field)?.as_str().map(String::from)
      })
      .unwrap_or_else(|| self.config.root_url.clone())
  }

  fn with_displayed<T>(&self, f: impl FnOnce(&mut HashMap<NotificationId, Notification>) -> T) -> T {
    let mut displayed = self
      .displayed
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut displayed)
  }
}
