use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;

use osp_worker::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use osp_worker::clients::{ClientKind, ClientMessage, Clients, WorkerMessage};
use osp_worker::config::Config;
use osp_worker::event::{EventLoop, EventSender, WorkerEvent};
use osp_worker::http::{Request, Response};
use osp_worker::logging;
use osp_worker::network::HttpFetcher;
use osp_worker::notify::ClickOutcome;
use osp_worker::pending::{PendingQueue, SharedQueue};
use osp_worker::worker::{FetchOutcome, ServiceWorker, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "osp-worker")]
#[command(about = "An offline-first caching worker with background sync and push notifications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/osp-worker/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v, -vv, -vvv)
  #[arg(short, long, action = ArgAction::Count)]
  verbose: u8,

  /// Keep caches in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the worker, caching every static file
  Install,
  /// Send a request through the worker
  Fetch {
    url: String,
    /// Send `Accept: text/html`
    #[arg(long)]
    html: bool,
    /// Send as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Fire a background sync tag
  Sync { tag: String },
  /// Deliver a push message and show its notification
  Push {
    /// JSON `{title, body, url}` or plain text
    payload: Option<String>,
    /// Click the notification with this action (open or close)
    #[arg(long)]
    click: Option<String>,
  },
  /// Post a JSON message from the page, e.g. {"type":"SKIP_WAITING"}
  Message { json: String },
  /// List caches and their entry counts
  Caches,
  /// Inspect or change the page's pending queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// Queue an action made while offline
  Add {
    kind: String,
    /// JSON payload
    data: String,
  },
  List,
  /// Simulate going offline and back online, syncing if anything is queued
  Reconnect,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init_logging(&config.log, logging::level_for_verbosity(args.verbose))?;

  if args.ephemeral {
    run(args.command, &config, MemoryStorage::new()).await
  } else {
    let storage = SqliteStorage::open(&config.database_path()?)?;
    run(args.command, &config, storage).await
  }
}

async fn run<S: CacheStorage + 'static>(command: Command, config: &Config, storage: S) -> Result<()> {
  let queue = PendingQueue::load(&config.pending_path()?).shared();
  let clients = Clients::new();
  let (_, mut inbox) = clients
    .connect(config.origin.as_str(), ClientKind::Window)
    .await;

  let fetcher = HttpFetcher::new(config)?;
  let worker = ServiceWorker::new(config, storage, fetcher, clients.clone(), Some(queue.clone()))?;

  let (event_loop, events) = EventLoop::new(worker.clone());
  let handle = tokio::spawn(event_loop.run());

  if !matches!(command, Command::Install | Command::Caches) {
    let state = worker.start().await?;
    if state != WorkerState::Activated {
      eprintln!("Worker is {}; requests will go straight to the network", state);
    }
  }

  match command {
    Command::Install => {
      events.dispatch(WorkerEvent::Install).await?;
      println!("{}", worker.state().await);
    }
    Command::Fetch {
      url,
      html,
      navigate,
    } => {
      let url = config.resolve(&url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      if html && !navigate {
        request = request.with_header("accept", "text/html");
      }

      let response = match events.fetch(request.clone()).await? {
        FetchOutcome::Respond(response) => response,
        FetchOutcome::Passthrough => worker.network_fetch(&request).await?,
      };
      print_response(&response);
    }
    Command::Sync { tag } => {
      events.dispatch(WorkerEvent::Sync { tag }).await?;
      print_messages(&mut inbox)?;
    }
    Command::Push { payload, click } => {
      events
        .dispatch(WorkerEvent::Push {
          data: payload.map(String::into_bytes),
        })
        .await?;

      let shown = worker.notifications().notifications().await;
      let notification = shown
        .last()
        .ok_or_else(|| eyre!("Push did not show a notification"))?;
      println!(
        "{}",
        serde_json::to_string_pretty(notification)
          .map_err(|e| eyre!("Failed to serialize notification: {}", e))?
      );

      if let Some(action) = click {
        // Keeps a window opened by the click connected while it is listed
        let _opened = match events.click(notification.id, Some(action)).await? {
          ClickOutcome::OpenedWindow { inbox, .. } => Some(inbox),
          ClickOutcome::Dismissed | ClickOutcome::FocusedExisting(_) => None,
        };

        for window in clients.match_all(Some(ClientKind::Window)).await {
          let marker = if window.focused { "*" } else { " " };
          println!("{} {}\t{}", marker, window.id, window.url);
        }
      }
    }
    Command::Message { json } => {
      let message: ClientMessage =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid message '{}': {}", json, e))?;
      events.dispatch(WorkerEvent::Message(message)).await?;
      println!("{}", worker.state().await);
    }
    Command::Caches => {
      for (name, entries) in worker.store().cache_names()? {
        println!("{}\t{}", name, entries);
      }
    }
    Command::Queue { action } => run_queue(action, &queue, &events, &mut inbox).await?,
  }

  drop(events);
  handle
    .await
    .map_err(|e| eyre!("Worker event loop panicked: {}", e))?;

  Ok(())
}

async fn run_queue(
  action: QueueAction,
  queue: &SharedQueue,
  events: &EventSender,
  inbox: &mut UnboundedReceiver<WorkerMessage>,
) -> Result<()> {
  match action {
    QueueAction::Add { kind, data } => {
      let data =
        serde_json::from_str(&data).map_err(|e| eyre!("Invalid JSON payload '{}': {}", data, e))?;
      let mut queue = queue.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let item = queue.append(&kind, data)?;
      println!("{}", item.id);
    }
    QueueAction::List => {
      let queue = queue.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      println!(
        "{}",
        serde_json::to_string_pretty(queue.items())
          .map_err(|e| eyre!("Failed to serialize pending queue: {}", e))?
      );
    }
    QueueAction::Reconnect => {
      let tag = {
        let mut queue = queue.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
        queue.set_online(false);
        queue.set_online(true)
      };

      match tag {
        Some(tag) => {
          events
            .dispatch(WorkerEvent::Sync {
              tag: tag.to_string(),
            })
            .await?;
          print_messages(inbox)?;
        }
        None => println!("Nothing to sync"),
      }
    }
  }

  Ok(())
}

fn print_response(response: &Response) {
  println!(
    "{} {} ({})",
    response.status, response.status_text, response.source
  );
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}

fn print_messages(inbox: &mut UnboundedReceiver<WorkerMessage>) -> Result<()> {
  while let Ok(message) = inbox.try_recv() {
    println!(
      "{}",
      serde_json::to_string(&message).map_err(|e| eyre!("Failed to serialize message: {}", e))?
    );
  }
  Ok(())
}
