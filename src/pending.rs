//! Page-side queue of actions taken while offline.
//!
//! The queue and the online flag live in one owned state object. It is loaded
//! from disk once, and only changes through `append`, `set_online` and `drain`,
//! each of which persists the new state.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::sync::SyncTag;

/// One deferred action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncItem {
  /// Creation time in milliseconds, unique within a queue
  pub id: i64,
  #[serde(rename = "type")]
  pub kind: String,
  pub data: Value,
  /// RFC 3339 creation timestamp
  pub timestamp: String,
}

/// A queue shared between the page and the worker.
pub type SharedQueue = Arc<Mutex<PendingQueue>>;

#[derive(Debug)]
pub struct PendingQueue {
  path: Option<PathBuf>,
  online: bool,
  items: Vec<PendingSyncItem>,
}

impl PendingQueue {
  /// Load the queue persisted at `path`. A missing or unreadable file is an empty queue.
  pub fn load(path: &Path) -> Self {
    let items = match std::fs::read_to_string(path) {
      Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Discarding corrupt pending queue");
        Vec::new()
      }),
      Err(_) => Vec::new(),
    };

    Self {
      path: Some(path.to_path_buf()),
      online: true,
      items,
    }
  }

  /// A queue that is never written to disk.
  pub fn in_memory() -> Self {
    Self {
      path: None,
      online: true,
      items: Vec::new(),
    }
  }

  pub fn shared(self) -> SharedQueue {
    Arc::new(Mutex::new(self))
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn is_online(&self) -> bool {
    self.online
  }

  pub fn items(&self) -> &[PendingSyncItem] {
    &self.items
  }

  /// Queue an action for the next sync.
  pub fn append(&mut self, kind: &str, data: Value) -> Result<&PendingSyncItem> {
    let now = Utc::now();
    let mut id = now.timestamp_millis();
    if let Some(last) = self.items.last() {
      id = id.max(last.id + 1);
    }

    self.items.push(PendingSyncItem {
      id,
      kind: kind.to_string(),
      data,
      timestamp: now.to_rfc3339(),
    });
    self.save()?;

    debug!(id, kind, pending = self.items.len(), "Queued for sync");
    self
      .items
      .last()
      .ok_or_else(|| eyre!("Pending queue is unexpectedly empty"))
  }

  /// Record a connectivity change.
  ///
  /// Coming back online with queued items returns the sync tag to request.
  pub fn set_online(&mut self, online: bool) -> Option<SyncTag> {
    let reconnected = online && !self.online;
    self.online = online;

    if reconnected && !self.items.is_empty() {
      Some(SyncTag::PendingData)
    } else {
      None
    }
  }

  /// Remove and return every queued item.
  pub fn drain(&mut self) -> Result<Vec<PendingSyncItem>> {
    let items = std::mem::take(&mut self.items);
    if let Err(e) = self.save() {
      // Keep the items so the next sync retries them
      self.items = items;
      return Err(e);
    }
    Ok(items)
  }

  fn save(&self) -> Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create directory for {}: {}", path.display(), e))?;
    }

    let contents = serde_json::to_string(&self.items)
      .map_err(|e| eyre!("Failed to serialize pending queue: {}", e))?;
    std::fs::write(path, contents)
      .map_err(|e| eyre!("Failed to write pending queue {}: {}", path.display(), e))?;

    Ok(())
  }
}
