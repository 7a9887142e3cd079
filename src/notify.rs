//! Push notifications and notification clicks.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::clients::{ClientInfo, ClientKind, Clients, WorkerMessage};
use crate::config::NotificationConfig;

/// Push message body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse a push message. Anything that is not a JSON object becomes the body.
  pub fn parse(data: &[u8]) -> Self {
    match serde_json::from_slice::<PushPayload>(data) {
      Ok(payload) => payload,
      Err(_) => Self {
        body: Some(String::from_utf8_lossy(data).into_owned()),
        ..Self::default()
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationData {
  pub url: String,
}

/// A notification shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// What a notification click led to.
#[derive(Debug)]
pub enum ClickOutcome {
  /// The close action; nothing beyond closing the notification
  Dismissed,
  /// An existing app window was navigated and focused
  FocusedExisting(ClientInfo),
  /// A new window; it stays connected while `inbox` is alive
  OpenedWindow {
    client: ClientInfo,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
  },
}

/// Notifications on screen. An entry stays until it is clicked or closed.
#[derive(Default)]
struct Shown {
  next_id: u64,
  notifications: Vec<Notification>,
}

pub struct NotificationDispatcher {
  config: NotificationConfig,
  clients: Clients,
  shown: Mutex<Shown>,
}

impl NotificationDispatcher {
  pub fn new(config: NotificationConfig, clients: Clients) -> Self {
    Self {
      config,
      clients,
      shown: Mutex::new(Shown::default()),
    }
  }

  /// Build and show the notification for a push message.
  pub async fn show_push(&self, data: Option<&[u8]>) -> Notification {
    let payload = data.map(PushPayload::parse).unwrap_or_default();

    let mut shown = self.shown.lock().await;
    shown.next_id += 1;

    let notification = Notification {
      id: shown.next_id,
      title: payload
        .title
        .unwrap_or_else(|| self.config.default_title.clone()),
      body: payload
        .body
        .unwrap_or_else(|| self.config.default_body.clone()),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: self.config.vibrate.clone(),
      data: NotificationData {
        url: payload
          .url
          .unwrap_or_else(|| self.config.default_url.clone()),
      },
      actions: vec![
        NotificationAction {
          action: "open".to_string(),
          title: "Open".to_string(),
        },
        NotificationAction {
          action: "close".to_string(),
          title: "Close".to_string(),
        },
      ],
    };

    info!(id = notification.id, title = %notification.title, "Showing notification");
    shown.notifications.push(notification.clone());
    notification
  }

  /// Notifications currently on screen.
  pub async fn notifications(&self) -> Vec<Notification> {
    self.shown.lock().await.notifications.clone()
  }

  /// The user closed a notification without clicking it.
  /// Returns false if it was not on screen.
  pub async fn close(&self, id: u64) -> bool {
    let mut shown = self.shown.lock().await;
    let before = shown.notifications.len();
    shown.notifications.retain(|n| n.id != id);
    debug!(id, "Notification closed");
    shown.notifications.len() != before
  }

  /// Close the notification, then focus or open the window it points at.
  pub async fn on_notification_click(
    &self,
    id: u64,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    let notification = {
      let mut shown = self.shown.lock().await;
      let index = shown
        .notifications
        .iter()
        .position(|n| n.id == id)
        .ok_or_else(|| eyre!("Notification {} is not shown", id))?;
      shown.notifications.remove(index)
    };
    debug!(id, ?action, "Notification clicked");

    if action == Some("close") {
      return Ok(ClickOutcome::Dismissed);
    }

    let url = &notification.data.url;
    let windows = self.clients.match_all(Some(ClientKind::Window)).await;
    if let Some(existing) = windows
      .iter()
      .find(|client| client.url.contains(&self.config.app_identifier))
    {
      self.clients.navigate(existing.id, url).await?;
      let focused = self.clients.focus(existing.id).await?;
      return Ok(ClickOutcome::FocusedExisting(focused));
    }

    let (client, inbox) = self.clients.open_window(url).await;
    Ok(ClickOutcome::OpenedWindow { client, inbox })
  }
}
