//! Boundary to the pages the worker controls and the platform's
//! notification surface.

use tracing::info;

use crate::notify::{Notification, NotificationId};

/// Pages (windows, tabs) controlled by the worker.
pub trait Clients: Send + Sync {
  /// Take control of already-open pages without waiting for a reload.
  fn claim(&self);

  /// Open or focus a window at `url`.
  fn open_window(&self, url: &str);
}

/// Platform surface that displays notifications.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification);

  fn close(&self, id: NotificationId);
}

/// Host used by the command line: every effect becomes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHost;

impl Clients for LogHost {
  fn claim(&self) {
    info!("Claiming clients");
  }

  fn open_window(&self, url: &str) {
    info!(url, "Opening window");
  }
}

impl Notifier for LogHost {
  fn show(&self, notification: &Notification) {
    let payload = &notification.payload;
    info!(
      id = notification.id,
      title = %payload.title,
      body = %payload.body,
      icon = %payload.icon,
      actions = payload.actions.len(),
      "Showing notification"
    );
  }

  fn close(&self, id: NotificationId) {
    info!(id, "Closing notification");
  }
}
