use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::clients::ClientMessage;
use crate::http::Request;
use crate::network::Fetch;
use crate::notify::ClickOutcome;
use crate::worker::{FetchOutcome, ServiceWorker};

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  /// Intercepted request; the sender is the single slot for its response
  Fetch {
    request: Request,
    respond_with: oneshot::Sender<FetchOutcome>,
  },
  /// Page -> worker message
  Message(ClientMessage),
  /// Background sync fired for a tag
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  /// The sender receives the outcome, including any window that was opened
  NotificationClick {
    notification: u64,
    action: Option<String>,
    respond_with: oneshot::Sender<Result<ClickOutcome>>,
  },
  /// Closed by the user without a click
  NotificationClose { notification: u64 },
}

impl WorkerEvent {
  fn name(&self) -> &'static str {
    match self {
      WorkerEvent::Install => "install",
      WorkerEvent::Activate => "activate",
      WorkerEvent::Fetch { .. } => "fetch",
      WorkerEvent::Message(_) => "message",
      WorkerEvent::Sync { .. } => "sync",
      WorkerEvent::Push { .. } => "push",
      WorkerEvent::NotificationClick { .. } => "notificationclick",
      WorkerEvent::NotificationClose { .. } => "notificationclose",
    }
  }
}

/// An event plus the token that is dropped once its handler has finished.
struct Dispatched {
  event: WorkerEvent,
  done: Option<oneshot::Sender<()>>,
}

/// Handle for delivering events to a running `EventLoop`.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Dispatched>,
}

impl EventSender {
  /// Queue an event without waiting for it to be handled.
  pub fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(Dispatched { event, done: None })
      .map_err(|_| eyre!("Worker event loop has stopped"))
  }

  /// Queue an event and wait until its handler, including all work it started, is done.
  pub async fn dispatch(&self, event: WorkerEvent) -> Result<()> {
    let (done, finished) = oneshot::channel();
    self
      .tx
      .send(Dispatched {
        event,
        done: Some(done),
      })
      .map_err(|_| eyre!("Worker event loop has stopped"))?;

    // The handler drops the token when it finishes; either outcome means done
    let _ = finished.await;
    Ok(())
  }

  /// Intercept a request and wait for the worker's answer.
  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    let (respond_with, response) = oneshot::channel();
    self.send(WorkerEvent::Fetch {
      request,
      respond_with,
    })?;

    response
      .await
      .map_err(|_| eyre!("Worker dropped the request without responding"))
  }

  /// Click a notification and wait for what the click led to.
  pub async fn click(&self, notification: u64, action: Option<String>) -> Result<ClickOutcome> {
    let (respond_with, outcome) = oneshot::channel();
    self.send(WorkerEvent::NotificationClick {
      notification,
      action,
      respond_with,
    })?;

    outcome
      .await
      .map_err(|_| eyre!("Worker dropped the click without handling it"))?
  }
}

/// Feeds events to the worker one at a time.
///
/// Lifecycle, message, sync, push and click events run to completion in
/// arrival order. Fetch events run on their own tasks so requests do not wait
/// on each other.
pub struct EventLoop<S: CacheStorage + 'static, F: Fetch + 'static> {
  worker: ServiceWorker<S, F>,
  rx: mpsc::UnboundedReceiver<Dispatched>,
}

impl<S: CacheStorage + 'static, F: Fetch + 'static> EventLoop<S, F> {
  pub fn new(worker: ServiceWorker<S, F>) -> (Self, EventSender) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { worker, rx }, EventSender { tx })
  }

  /// Run until every `EventSender` has been dropped.
  pub async fn run(mut self) {
    while let Some(Dispatched { event, done }) = self.rx.recv().await {
      debug!(event = event.name(), "Dispatching event");

      match event {
        WorkerEvent::Fetch {
          request,
          respond_with,
        } => {
          let worker = self.worker.clone();
          tokio::spawn(async move {
            let outcome = worker.handle_fetch(&request).await;
            if respond_with.send(outcome).is_err() {
              debug!(url = %request.url, "Requester went away before the response");
            }
            drop(done);
          });
        }
        event => {
          self.handle(event).await;
          drop(done);
        }
      }
    }
  }

  async fn handle(&self, event: WorkerEvent) {
    let name = event.name();
    let result = match event {
      WorkerEvent::Install => self.worker.install().await.map(|_| ()),
      WorkerEvent::Activate => self.worker.activate().await,
      WorkerEvent::Message(message) => self.worker.handle_message(message).await,
      WorkerEvent::Sync { tag } => self.worker.handle_sync(&tag).await.map(|_| ()),
      WorkerEvent::Push { data } => {
        self.worker.handle_push(data.as_deref()).await;
        Ok(())
      }
      WorkerEvent::NotificationClick {
        notification,
        action,
        respond_with,
      } => {
        let outcome = self
          .worker
          .handle_notification_click(notification, action.as_deref())
          .await;
        if let Err(e) = &outcome {
          warn!(event = name, error = %e, "Event handler failed");
        }
        if respond_with.send(outcome).is_err() {
          debug!(notification, "Clicker went away before the outcome");
        }
        Ok(())
      }
      WorkerEvent::NotificationClose { notification } => {
        self.worker.handle_notification_close(notification).await;
        Ok(())
      }
      WorkerEvent::Fetch { .. } => Ok(()),
    };

    if let Err(e) = result {
      warn!(event = name, error = %e, "Event handler failed");
    }
  }
}
