//! Page clients connected to the worker, and the messages exchanged with them.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Worker -> page messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SyncComplete { message: String },
}

/// Page -> worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate a waiting worker without waiting for old clients to close
  SkipWaiting,
  /// Warm the dynamic cache with these URLs
  CacheUrls { urls: Vec<String> },
}

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
  Window,
  Worker,
}

/// Snapshot of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: ClientId,
  pub url: String,
  pub kind: ClientKind,
  pub focused: bool,
  /// Whether the active worker controls this client
  pub controlled: bool,
}

struct ClientSlot {
  info: ClientInfo,
  tx: mpsc::UnboundedSender<WorkerMessage>,
}

#[derive(Default)]
struct Registry {
  next_id: ClientId,
  slots: Vec<ClientSlot>,
}

impl Registry {
  fn add(&mut self, url: &str, kind: ClientKind) -> (ClientInfo, mpsc::UnboundedReceiver<WorkerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.next_id += 1;
    let info = ClientInfo {
      id: self.next_id,
      url: url.to_string(),
      kind,
      focused: false,
      controlled: false,
    };
    self.slots.push(ClientSlot {
      info: info.clone(),
      tx,
    });
    (info, rx)
  }

  /// Forget clients whose page has dropped its receiver.
  fn prune(&mut self) {
    let before = self.slots.len();
    self.slots.retain(|slot| !slot.tx.is_closed());
    if self.slots.len() != before {
      debug!(removed = before - self.slots.len(), "Pruned closed clients");
    }
  }

  fn slot_mut(&mut self, id: ClientId) -> Result<&mut ClientSlot> {
    self
      .slots
      .iter_mut()
      .find(|slot| slot.info.id == id)
      .ok_or_else(|| eyre!("Client {} is not connected", id))
  }
}

/// Registry of connected clients.
///
/// Cloning is cheap; all clones see the same clients.
#[derive(Clone, Default)]
pub struct Clients {
  inner: Arc<Mutex<Registry>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a page. The receiver gets every message posted to it.
  pub async fn connect(
    &self,
    url: &str,
    kind: ClientKind,
  ) -> (ClientId, mpsc::UnboundedReceiver<WorkerMessage>) {
    let (info, rx) = self.inner.lock().await.add(url, kind);
    debug!(client = info.id, url, "Client connected");
    (info.id, rx)
  }

  pub async fn disconnect(&self, id: ClientId) {
    self.inner.lock().await.slots.retain(|slot| slot.info.id != id);
  }

  pub async fn get(&self, id: ClientId) -> Option<ClientInfo> {
    let mut registry = self.inner.lock().await;
    registry.prune();
    registry
      .slots
      .iter()
      .find(|slot| slot.info.id == id)
      .map(|slot| slot.info.clone())
  }

  /// Connected clients, optionally of one kind only, in connection order.
  pub async fn match_all(&self, kind: Option<ClientKind>) -> Vec<ClientInfo> {
    let mut registry = self.inner.lock().await;
    registry.prune();
    registry
      .slots
      .iter()
      .filter(|slot| kind.map_or(true, |k| slot.info.kind == k))
      .map(|slot| slot.info.clone())
      .collect()
  }

  /// Take control of every connected client. Returns how many were claimed.
  pub async fn claim(&self) -> usize {
    let mut registry = self.inner.lock().await;
    registry.prune();
    for slot in &mut registry.slots {
      slot.info.controlled = true;
    }
    registry.slots.len()
  }

  /// Deliver a message to one client. Returns false if its page has gone away.
  pub async fn post_message(&self, id: ClientId, message: WorkerMessage) -> Result<bool> {
    let mut registry = self.inner.lock().await;
    let slot = registry.slot_mut(id)?;
    Ok(slot.tx.send(message).is_ok())
  }

  /// Deliver a message to every connected client. Returns how many received it.
  pub async fn broadcast(&self, message: &WorkerMessage) -> usize {
    let mut registry = self.inner.lock().await;
    let delivered = registry
      .slots
      .iter()
      .filter(|slot| slot.tx.send(message.clone()).is_ok())
      .count();
    registry.prune();
    delivered
  }

  pub async fn navigate(&self, id: ClientId, url: &str) -> Result<ClientInfo> {
    let mut registry = self.inner.lock().await;
    let slot = registry.slot_mut(id)?;
    slot.info.url = url.to_string();
    Ok(slot.info.clone())
  }

  /// Focus one window; every other client loses focus.
  pub async fn focus(&self, id: ClientId) -> Result<ClientInfo> {
    let mut registry = self.inner.lock().await;
    registry.slot_mut(id)?;

    let mut focused = None;
    for slot in &mut registry.slots {
      slot.info.focused = slot.info.id == id;
      if slot.info.focused {
        focused = Some(slot.info.clone());
      }
    }
    focused.ok_or_else(|| eyre!("Client {} is not connected", id))
  }

  /// Open a new focused window at `url`.
  ///
  /// The window stays connected for as long as the returned receiver lives.
  pub async fn open_window(
    &self,
    url: &str,
  ) -> (ClientInfo, mpsc::UnboundedReceiver<WorkerMessage>) {
    let mut registry = self.inner.lock().await;
    registry.prune();
    for slot in &mut registry.slots {
      slot.info.focused = false;
    }

    let (mut info, rx) = registry.add(url, ClientKind::Window);
    info.focused = true;
    if let Some(slot) = registry.slots.last_mut() {
      slot.info.focused = true;
    }
    debug!(client = info.id, url, "Opened window");
    (info, rx)
  }
}
