//! Version lifecycle: install, activate, and the control messages pages send.
//!
//! A version is one named cache store. Installing it precaches the manifest
//! into a fresh store; activating it makes that store the one every strategy
//! reads and writes, and garbage-collects every other store.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{ActiveStore, CacheLayer, CacheStorage, CachedEntry, RequestKey};
use crate::clients::Clients;
use crate::error::{Result, WorkerError};
use crate::network::{Network, Request};

/// Where a version is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
  Installing,
  Installed,
  Activating,
  Active,
  /// Replaced by a newer active version
  Superseded,
  /// Install failed; the store is gone
  Redundant,
}

impl fmt::Display for VersionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Message posted to the worker by a page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate as soon as the install is done
  SkipWaiting,
  GetVersion,
}

/// Reply posted back to the page that sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  Version { version: String },
}

/// Drives one worker version through install and activation.
pub struct Lifecycle<S: CacheStorage, N: Network> {
  /// Store this version installs into
  store_name: String,
  manifest: Vec<Url>,
  storage: Arc<S>,
  layer: CacheLayer<S, N>,
  clients: Arc<dyn Clients>,
  active: ActiveStore,
  versions: Mutex<BTreeMap<String, VersionState>>,
  skip_waiting: AtomicBool,
  /// Serializes install and activate
  gate: tokio::sync::Mutex<()>,
}

impl<S: CacheStorage, N: Network> Lifecycle<S, N> {
  pub fn new(
    store_name: String,
    manifest: Vec<Url>,
    storage: Arc<S>,
    layer: CacheLayer<S, N>,
    clients: Arc<dyn Clients>,
    active: ActiveStore,
    skip_waiting: bool,
  ) -> Self {
    Self {
      store_name,
      manifest,
      storage,
      layer,
      clients,
      active,
      versions: Mutex::new(BTreeMap::new()),
      skip_waiting: AtomicBool::new(skip_waiting),
      gate: tokio::sync::Mutex::new(()),
    }
  }

  /// Pick up the version a previous run left active, and this version's
  /// own install if it completed without being activated.
  pub fn restore(&self) -> Result<Option<String>> {
    let active = self.storage.active_store()?;
    match &active {
      Some(name) => {
        info!(store = %name, "Restored active version");
        self.active.set(name);
        self.set_state(name, VersionState::Active);
      }
      None => debug!("No version has been activated yet"),
    }

    let installed = self.storage.installed_store()?;
    if let Some(name) = installed.filter(|n| *n == self.store_name && active.as_ref() != Some(n)) {
      if self.storage.list_store_names()?.contains(&name) {
        info!(store = %name, "Restored installed version, waiting to activate");
        self.set_state(&name, VersionState::Installed);
      }
    }

    Ok(active)
  }

  /// State of this worker's own version, if it has started installing.
  pub fn state(&self) -> Option<VersionState> {
    self.state_of(&self.store_name)
  }

  pub fn state_of(&self, store: &str) -> Option<VersionState> {
    self.with_versions(|versions| versions.get(store).copied())
  }

  /// The version answering requests right now, or this worker's own when
  /// nothing is active yet.
  pub fn version(&self) -> String {
    self.active.get().unwrap_or_else(|| self.store_name.clone())
  }

  /// Precache every manifest URL into a fresh store.
  ///
  /// All or nothing: if any URL fails or answers non-2xx the new store is
  /// deleted, the version becomes redundant, and whatever was active keeps
  /// serving. Activates straight away when skip-waiting is set.
  pub async fn install(&self) -> Result<()> {
    let _gate = self.gate.lock().await;

    if self.state() == Some(VersionState::Active) {
      debug!(store = %self.store_name, "Version already active, nothing to install");
      return Ok(());
    }

    info!(store = %self.store_name, urls = self.manifest.len(), "Installing version");
    self.set_state(&self.store_name, VersionState::Installing);

    if let Err(e) = self.precache().await {
      warn!(store = %self.store_name, error = %e, "Install failed, keeping previous version");
      if let Err(cleanup) = self.storage.delete_store(&self.store_name) {
        warn!(store = %self.store_name, error = %cleanup, "Failed to remove incomplete store");
      }
      self.set_state(&self.store_name, VersionState::Redundant);
      return Err(e);
    }

    self.set_state(&self.store_name, VersionState::Installed);
    info!(store = %self.store_name, "Version installed");

    if self.skip_waiting.load(Ordering::Acquire) {
      self.activate_locked()?;
    }
    Ok(())
  }

  async fn precache(&self) -> Result<()> {
    let fetches = self.manifest.iter().map(|url| async move {
      let result = self.layer.fetch_with_timeout(Request::get(url.clone())).await;
      (url, result)
    });

    let mut entries = Vec::with_capacity(self.manifest.len());
    for (url, result) in join_all(fetches).await {
      let reason = match result {
        Ok(response) if response.is_success() => {
          entries.push(CachedEntry::from_response(RequestKey::get(url.clone()), &response));
          continue;
        }
        Ok(response) => format!("status {}", response.status),
        Err(e) => e.to_string(),
      };

      return Err(WorkerError::InstallIncomplete {
        store: self.store_name.clone(),
        url: url.to_string(),
        reason,
      });
    }

    self.storage.create_store(&self.store_name)?;
    self.storage.put_all(&self.store_name, &entries)?;
    self.storage.set_installed_store(&self.store_name)
  }

  /// Make the installed version the active one.
  ///
  /// Every other store is deleted once the new one is live, then open pages
  /// are claimed.
  pub async fn activate(&self) -> Result<()> {
    let _gate = self.gate.lock().await;
    self.activate_locked()
  }

  /// Activation proper. Callers hold the gate.
  fn activate_locked(&self) -> Result<()> {
    match self.state() {
      Some(VersionState::Installed) => {}
      Some(VersionState::Active) => return Ok(()),
      other => {
        let state = other.map_or_else(|| "not installed".to_string(), |s| s.to_string());
        return Err(WorkerError::InvalidState(format!(
          "cannot activate {} while {}",
          self.store_name, state
        )));
      }
    }

    self.set_state(&self.store_name, VersionState::Activating);
    let previous = self.active.get();

    self.storage.set_active_store(&self.store_name)?;
    self.active.set(&self.store_name);

    for name in self.storage.list_store_names()? {
      if name == self.store_name {
        continue;
      }
      match self.storage.delete_store(&name) {
        Ok(_) => debug!(store = %name, "Deleted old cache store"),
        Err(e) => warn!(store = %name, error = %e, "Failed to delete old cache store"),
      }
    }

    if let Some(previous) = previous.filter(|p| *p != self.store_name) {
      self.set_state(&previous, VersionState::Superseded);
    }
    self.set_state(&self.store_name, VersionState::Active);
    self.clients.claim();

    info!(store = %self.store_name, "Version activated");
    Ok(())
  }

  /// Handle a control message, returning the reply to post back (if any).
  pub async fn on_message(&self, message: ControlMessage) -> Option<ControlReply> {
    match message {
      ControlMessage::SkipWaiting => {
        debug!("Skip waiting requested");
        self.skip_waiting.store(true, Ordering::Release);
        if self.state() == Some(VersionState::Installed) {
          if let Err(e) = self.activate().await {
            warn!(error = %e, "Activation after skip waiting failed");
          }
        }
        None
      }
      ControlMessage::GetVersion => Some(ControlReply::Version {
        version: self.version(),
      }),
    }
  }

  fn set_state(&self, store: &str, state: VersionState) {
    debug!(store, %state, "Version state changed");
    self.with_versions(|versions| {
      versions.insert(store.to_string(), state);
    });
  }

  fn with_versions<T>(&self, f: impl FnOnce(&mut BTreeMap<String, VersionState>) -> T) -> T {
    let mut versions = self
      .versions
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut versions)
  }
}
