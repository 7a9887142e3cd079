//! Background sync: runs deferred jobs by tag and tells clients when they finish.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::clients::{Clients, WorkerMessage};
use crate::pending::SharedQueue;

/// Known background sync jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTag {
  /// Flush the page's generic pending queue
  PendingData,
  Inbound,
  Outbound,
}

impl SyncTag {
  pub const ALL: [SyncTag; 3] = [SyncTag::PendingData, SyncTag::Inbound, SyncTag::Outbound];

  pub fn as_str(&self) -> &'static str {
    match self {
      SyncTag::PendingData => "sync-pending-data",
      SyncTag::Inbound => "sync-inbound",
      SyncTag::Outbound => "sync-outbound",
    }
  }

  pub fn parse(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|t| t.as_str() == tag)
  }
}

impl std::fmt::Display for SyncTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
  #[default]
  Idle,
  Running,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub tag: SyncTag,
  /// Pending items taken from the queue
  pub drained: usize,
  /// Clients that received SYNC_COMPLETE
  pub notified: usize,
}

pub struct SyncCoordinator {
  clients: Clients,
  pending: Option<SharedQueue>,
  complete_message: String,
  states: HashMap<SyncTag, SyncState>,
}

impl SyncCoordinator {
  pub fn new(clients: Clients, pending: Option<SharedQueue>, complete_message: String) -> Self {
    Self {
      clients,
      pending,
      complete_message,
      states: HashMap::new(),
    }
  }

  pub fn state(&self, tag: SyncTag) -> SyncState {
    self.states.get(&tag).copied().unwrap_or_default()
  }

  /// Run the job for `tag`. Unknown tags are ignored and yield `None`.
  pub async fn handle(&mut self, tag: &str) -> Result<Option<SyncReport>> {
    let Some(tag) = SyncTag::parse(tag) else {
      debug!(tag, "Ignoring unknown sync tag");
      return Ok(None);
    };

    info!(%tag, "Background sync triggered");
    self.states.insert(tag, SyncState::Running);
    let result = self.run(tag).await;
    self.states.insert(tag, SyncState::Idle);

    result.map(Some)
  }

  async fn run(&self, tag: SyncTag) -> Result<SyncReport> {
    match tag {
      SyncTag::PendingData => {
        let drained = self.drain_pending()?;
        let notified = self
          .clients
          .broadcast(&WorkerMessage::SyncComplete {
            message: self.complete_message.clone(),
          })
          .await;

        info!(drained, notified, "Pending data synced");
        Ok(SyncReport {
          tag,
          drained,
          notified,
        })
      }
      SyncTag::Inbound | SyncTag::Outbound => {
        info!(%tag, "Sync finished");
        Ok(SyncReport {
          tag,
          drained: 0,
          notified: 0,
        })
      }
    }
  }

  fn drain_pending(&self) -> Result<usize> {
    let Some(queue) = &self.pending else {
      return Ok(0);
    };

    let items = queue
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .drain()?;

    for item in &items {
      debug!(id = item.id, kind = %item.kind, "Flushed pending item");
    }
    Ok(items.len())
  }
}
