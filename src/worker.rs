//! The worker: lifecycle, fetch interception and the other event handlers.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheNames, CacheStorage, CacheStore, Partition};
use crate::clients::{ClientMessage, Clients};
use crate::config::{Config, InstallPolicy};
use crate::http::{Request, Response};
use crate::network::Fetch;
use crate::notify::{ClickOutcome, Notification, NotificationDispatcher};
use crate::pending::SharedQueue;
use crate::router::Router;
use crate::strategy::Strategies;
use crate::sync::{SyncCoordinator, SyncReport};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, install not started
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  /// Controlling clients and intercepting fetches
  Activated,
  /// Failed install; never activates
  Redundant,
}

impl WorkerState {
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Result of intercepting a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  /// The worker declined; the request goes to the network as usual
  Passthrough,
  Respond(Response),
}

/// The worker. Cloning is cheap; clones share all state.
pub struct ServiceWorker<S: CacheStorage, F: Fetch> {
  state: Arc<RwLock<WorkerState>>,
  router: Arc<Router>,
  strategies: Arc<Strategies<S, F>>,
  clients: Clients,
  sync: Arc<Mutex<SyncCoordinator>>,
  notifications: Arc<NotificationDispatcher>,
  manifest: Arc<Vec<Request>>,
  policy: InstallPolicy,
  origin: url::Url,
}

impl<S: CacheStorage, F: Fetch> Clone for ServiceWorker<S, F> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      router: Arc::clone(&self.router),
      strategies: Arc::clone(&self.strategies),
      clients: self.clients.clone(),
      sync: Arc::clone(&self.sync),
      notifications: Arc::clone(&self.notifications),
      manifest: Arc::clone(&self.manifest),
      policy: self.policy,
      origin: self.origin.clone(),
    }
  }
}

impl<S: CacheStorage, F: Fetch> ServiceWorker<S, F> {
  pub fn new(
    config: &Config,
    storage: S,
    fetcher: F,
    clients: Clients,
    pending: Option<SharedQueue>,
  ) -> Result<Self> {
    let names = CacheNames::new(&config.cache.prefix, &config.cache.version);
    let store = CacheStore::new(storage, names);

    let manifest = config
      .install
      .static_files
      .iter()
      .map(|file| config.resolve(file).map(Request::get))
      .collect::<Result<Vec<_>>>()?;
    let offline_document = Request::get(config.resolve(&config.install.offline_document)?);

    let strategies = Strategies::new(
      store,
      fetcher,
      offline_document,
      Duration::from_secs(config.network.timeout_secs),
    );
    let sync = SyncCoordinator::new(
      clients.clone(),
      pending,
      config.notifications.sync_complete_message.clone(),
    );
    let notifications = NotificationDispatcher::new(config.notifications.clone(), clients.clone());

    Ok(Self {
      state: Arc::new(RwLock::new(WorkerState::Parsed)),
      router: Arc::new(Router::new(&config.routing)?),
      strategies: Arc::new(strategies),
      clients,
      sync: Arc::new(Mutex::new(sync)),
      notifications: Arc::new(notifications),
      manifest: Arc::new(manifest),
      policy: config.install.policy,
      origin: config.origin.clone(),
    })
  }

  pub async fn state(&self) -> WorkerState {
    *self.state.read().await
  }

  pub fn store(&self) -> &CacheStore<S> {
    self.strategies.store()
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn notifications(&self) -> &NotificationDispatcher {
    &self.notifications
  }

  /// Bring the worker up: resume the current version if an earlier install
  /// cached the whole manifest, otherwise install it.
  pub async fn start(&self) -> Result<WorkerState> {
    let parsed = self.state().await == WorkerState::Parsed;
    if parsed && self.store().holds_all(Partition::Static, &self.manifest)? {
      info!(version = self.store().names().version(), "Resuming installed version");
      *self.state.write().await = WorkerState::Installed;
      self.activate().await?;
      return Ok(self.state().await);
    }

    self.install().await
  }

  /// Cache the static manifest, then activate without waiting.
  ///
  /// If any asset cannot be cached the outcome depends on the install policy:
  /// lenient leaves the worker installed but waiting, strict discards it.
  pub async fn install(&self) -> Result<WorkerState> {
    self.transition(WorkerState::Parsed, WorkerState::Installing).await?;
    info!(version = self.store().names().version(), "Installing worker");

    let result = match self.store().open(Partition::Static) {
      Ok(cache) => cache.add_all(self.strategies.fetcher(), &self.manifest).await,
      Err(e) => Err(e),
    };

    match result {
      Ok(count) => {
        info!(count, "Static files cached");
        *self.state.write().await = WorkerState::Installed;
        self.skip_waiting().await?;
      }
      Err(e) => match self.policy {
        InstallPolicy::Lenient => {
          error!(error = %e, "Failed to cache static files");
          *self.state.write().await = WorkerState::Installed;
        }
        InstallPolicy::Strict => {
          error!(error = %e, "Failed to cache static files, discarding worker");
          *self.state.write().await = WorkerState::Redundant;
          return Err(e);
        }
      },
    }

    Ok(self.state().await)
  }

  /// Remove caches from older versions and take control of every client.
  pub async fn activate(&self) -> Result<()> {
    self.transition(WorkerState::Installed, WorkerState::Activating).await?;
    info!("Activating worker");

    let deleted = match self.prepare_partitions() {
      Ok(deleted) => deleted,
      Err(e) => {
        // Stay installed so a later trigger can retry
        *self.state.write().await = WorkerState::Installed;
        return Err(e);
      }
    };

    let claimed = self.clients.claim().await;
    *self.state.write().await = WorkerState::Activated;
    info!(deleted = deleted.len(), claimed, "Worker activated");
    Ok(())
  }

  /// Activate now if installed and waiting; otherwise nothing to do.
  pub async fn skip_waiting(&self) -> Result<()> {
    if self.state().await == WorkerState::Installed {
      self.activate().await?;
    }
    Ok(())
  }

  /// Intercept a request. Nothing is routed until activation has finished.
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    if !self.state().await.can_intercept_fetch() {
      debug!(url = %request.url, "Not active, passing through");
      return FetchOutcome::Passthrough;
    }

    let dispatch = self.router.route(request);
    debug!(url = %request.url, ?dispatch, "Routed request");

    match self.strategies.respond(request, dispatch).await {
      Some(response) => FetchOutcome::Respond(response),
      None => FetchOutcome::Passthrough,
    }
  }

  /// Perform a passed-through request directly against the network.
  pub async fn network_fetch(&self, request: &Request) -> Result<Response> {
    self.strategies.fetcher().fetch(request).await
  }

  pub async fn handle_message(&self, message: ClientMessage) -> Result<()> {
    debug!(?message, "Message received");

    match message {
      ClientMessage::SkipWaiting => self.skip_waiting().await,
      ClientMessage::CacheUrls { urls } => {
        let requests = urls
          .iter()
          .map(|url| self.origin.join(url).map(Request::get))
          .collect::<std::result::Result<Vec<_>, _>>()
          .map_err(|e| eyre!("Invalid URL in CACHE_URLS: {}", e))?;

        let cache = self.store().open(Partition::Dynamic)?;
        match cache.add_all(self.strategies.fetcher(), &requests).await {
          Ok(count) => {
            info!(count, "Warmed dynamic cache");
            Ok(())
          }
          Err(e) => {
            warn!(error = %e, "Failed to warm dynamic cache");
            Err(e)
          }
        }
      }
    }
  }

  pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    self.sync.lock().await.handle(tag).await
  }

  pub async fn handle_push(&self, data: Option<&[u8]>) -> Notification {
    info!("Push received");
    self.notifications.show_push(data).await
  }

  pub async fn handle_notification_click(
    &self,
    notification: u64,
    action: Option<&str>,
  ) -> Result<ClickOutcome> {
    self
      .notifications
      .on_notification_click(notification, action)
      .await
  }

  pub async fn handle_notification_close(&self, notification: u64) {
    self.notifications.close(notification).await;
  }

  /// Open the current partitions and drop every stale one.
  fn prepare_partitions(&self) -> Result<Vec<String>> {
    for partition in Partition::ALL {
      self.store().open(partition)?;
    }
    self.store().delete_stale()
  }

  async fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
    let mut state = self.state.write().await;
    if *state != from {
      return Err(eyre!(
        "Invalid worker state: expected {}, got {}",
        from,
        *state
      ));
    }
    *state = to;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use crate::clients::{ClientKind, WorkerMessage};
  use crate::http::ResponseSource;
  use crate::pending::PendingQueue;
  use crate::testing::ScriptedFetcher;
  use serde_json::json;
  use url::Url;

  type TestWorker = ServiceWorker<MemoryStorage, Arc<ScriptedFetcher>>;

  fn config() -> Config {
    Config::from_yaml(
      r#"
origin: "http://localhost/"
install:
  static_files: ["./", "./index.html", "./css/app.css", "./offline.html"]
"#,
    )
    .unwrap()
  }

  fn online_fetcher() -> Arc<ScriptedFetcher> {
    Arc::new(
      ScriptedFetcher::new()
        .with("http://localhost/", Response::ok("<html>root</html>"))
        .with("http://localhost/index.html", Response::ok("<html>index</html>"))
        .with("http://localhost/css/app.css", Response::ok("body { margin: 0 }"))
        .with("http://localhost/offline.html", Response::ok("<html>offline</html>")),
    )
  }

  fn worker_with(
    config: &Config,
    storage: MemoryStorage,
    fetcher: Arc<ScriptedFetcher>,
  ) -> TestWorker {
    ServiceWorker::new(config, storage, fetcher, Clients::new(), None).unwrap()
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_install_caches_manifest_and_activates() {
    let fetcher = online_fetcher();
    let worker = worker_with(&config(), MemoryStorage::new(), fetcher.clone());

    assert_eq!(worker.install().await.unwrap(), WorkerState::Activated);
    assert_eq!(fetcher.calls(), 4);

    // Every manifest entry is now served without touching the network
    for url in ["http://localhost/index.html", "http://localhost/css/app.css"] {
      let FetchOutcome::Respond(response) = worker.handle_fetch(&get(url)).await else {
        panic!("expected a response for {}", url);
      };
      assert_eq!(response.source, ResponseSource::Cache);
    }
    assert_eq!(fetcher.calls(), 4);
  }

  #[tokio::test]
  async fn test_lenient_install_failure_waits_for_skip_waiting() {
    let fetcher = Arc::new(ScriptedFetcher::new().with("http://localhost/", Response::ok("root")));
    let worker = worker_with(&config(), MemoryStorage::new(), fetcher);

    assert_eq!(worker.install().await.unwrap(), WorkerState::Installed);
    assert!(!worker
      .store()
      .holds_all(Partition::Static, &worker.manifest)
      .unwrap());
    assert_eq!(
      worker.handle_fetch(&get("http://localhost/css/app.css")).await,
      FetchOutcome::Passthrough
    );

    worker.handle_message(ClientMessage::SkipWaiting).await.unwrap();
    assert_eq!(worker.state().await, WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_strict_install_failure_discards_worker() {
    let mut config = config();
    config.install.policy = InstallPolicy::Strict;
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.set_offline(true);
    let worker = worker_with(&config, MemoryStorage::new(), fetcher);

    assert!(worker.install().await.is_err());
    assert_eq!(worker.state().await, WorkerState::Redundant);
    assert!(worker.activate().await.is_err());
    assert!(worker.skip_waiting().await.is_ok());
    assert_eq!(worker.state().await, WorkerState::Redundant);
  }

  #[tokio::test]
  async fn test_activation_prunes_old_versions() {
    let storage = MemoryStorage::new();
    for name in ["ksi-osp-static-v0.9.0", "ksi-osp-data-v0.9.0", "unrelated-cache"] {
      storage.open_cache(name).unwrap();
    }
    let worker = worker_with(&config(), storage, online_fetcher());
    worker.install().await.unwrap();

    let names: Vec<String> = worker
      .store()
      .cache_names()
      .unwrap()
      .into_iter()
      .map(|(name, _)| name)
      .collect();
    assert_eq!(
      names,
      vec![
        "unrelated-cache",
        "ksi-osp-static-v1.0.0",
        "ksi-osp-dynamic-v1.0.0",
        "ksi-osp-data-v1.0.0"
      ]
    );
  }

  #[tokio::test]
  async fn test_activation_claims_clients() {
    let clients = Clients::new();
    let (id, _rx) = clients.connect("http://localhost/index.html", ClientKind::Window).await;
    let worker: TestWorker =
      ServiceWorker::new(&config(), MemoryStorage::new(), online_fetcher(), clients.clone(), None)
        .unwrap();

    worker.install().await.unwrap();
    assert!(clients.get(id).await.unwrap().controlled);
  }

  #[tokio::test]
  async fn test_start_resumes_installed_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let config = config();

    let first = ServiceWorker::new(
      &config,
      SqliteStorage::open(&path).unwrap(),
      online_fetcher(),
      Clients::new(),
      None,
    )
    .unwrap();
    assert_eq!(first.start().await.unwrap(), WorkerState::Activated);
    drop(first);

    // Same database, new worker instance, network gone
    let offline = Arc::new(ScriptedFetcher::new());
    offline.set_offline(true);
    let second = ServiceWorker::new(
      &config,
      SqliteStorage::open(&path).unwrap(),
      offline.clone(),
      Clients::new(),
      None,
    )
    .unwrap();

    assert_eq!(second.start().await.unwrap(), WorkerState::Activated);
    assert_eq!(offline.calls(), 0);

    let request = get("http://localhost/css/app.css");
    let FetchOutcome::Respond(response) = second.handle_fetch(&request).await else {
      panic!("expected a cached response");
    };
    assert_eq!(response.text(), "body { margin: 0 }");
  }

  #[tokio::test]
  async fn test_start_reinstalls_after_partial_install() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let config = config();

    // Everything but the offline document is reachable
    let partial = Arc::new(
      ScriptedFetcher::new()
        .with("http://localhost/", Response::ok("<html>root</html>"))
        .with("http://localhost/index.html", Response::ok("<html>index</html>"))
        .with("http://localhost/css/app.css", Response::ok("body { margin: 0 }")),
    );
    let first = ServiceWorker::new(
      &config,
      SqliteStorage::open(&path).unwrap(),
      partial,
      Clients::new(),
      None,
    )
    .unwrap();
    assert_eq!(first.start().await.unwrap(), WorkerState::Installed);
    first.handle_message(ClientMessage::SkipWaiting).await.unwrap();
    assert!(matches!(
      first.handle_fetch(&get("http://localhost/css/app.css")).await,
      FetchOutcome::Respond(_)
    ));
    drop(first);

    let fetcher = online_fetcher();
    let second = ServiceWorker::new(
      &config,
      SqliteStorage::open(&path).unwrap(),
      fetcher.clone(),
      Clients::new(),
      None,
    )
    .unwrap();
    assert_eq!(second.start().await.unwrap(), WorkerState::Activated);
    assert_eq!(fetcher.calls(), 4);

    fetcher.set_offline(true);
    let page = Request::navigate(Url::parse("http://localhost/m_9_4_0.html").unwrap());
    let FetchOutcome::Respond(response) = second.handle_fetch(&page).await else {
      panic!("expected a response");
    };
    assert_eq!(response.text(), "<html>offline</html>");
  }

  #[tokio::test]
  async fn test_static_asset_scenario() {
    let fetcher = online_fetcher();
    let worker = worker_with(&config(), MemoryStorage::new(), fetcher.clone());
    worker.install().await.unwrap();
    fetcher.set("http://localhost/css/extra.css", Response::ok(".extra {}"));

    let request = get("http://localhost/css/extra.css");
    let FetchOutcome::Respond(online) = worker.handle_fetch(&request).await else {
      panic!("expected a response");
    };
    assert_eq!(online.status, 200);
    assert_eq!(online.source, ResponseSource::Network);

    fetcher.set_offline(true);
    let FetchOutcome::Respond(offline) = worker.handle_fetch(&request).await else {
      panic!("expected a response");
    };
    assert_eq!(offline.body, online.body);
    assert_eq!(offline.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_offline_navigation_and_api_fallbacks() {
    let fetcher = online_fetcher();
    let worker = worker_with(&config(), MemoryStorage::new(), fetcher.clone());
    worker.install().await.unwrap();
    fetcher.set_offline(true);

    let page = Request::navigate(Url::parse("http://localhost/m_9_3_0.html").unwrap());
    let FetchOutcome::Respond(response) = worker.handle_fetch(&page).await else {
      panic!("expected a response");
    };
    assert_eq!(response.text(), "<html>offline</html>");

    let api = get("http://localhost/api/stock");
    let FetchOutcome::Respond(response) = worker.handle_fetch(&api).await else {
      panic!("expected a response");
    };
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_cache_urls_warms_dynamic_partition() {
    let fetcher = online_fetcher();
    fetcher.set("http://localhost/m_9_6_0.html", Response::ok("<html>96</html>"));
    let worker = worker_with(&config(), MemoryStorage::new(), fetcher);
    worker.install().await.unwrap();

    worker
      .handle_message(ClientMessage::CacheUrls {
        urls: vec!["./m_9_6_0.html".to_string()],
      })
      .await
      .unwrap();

    let cache = worker.store().open(Partition::Dynamic).unwrap();
    let found = cache
      .match_request(&get("http://localhost/m_9_6_0.html"))
      .unwrap()
      .unwrap();
    assert_eq!(found.text(), "<html>96</html>");
  }

  #[tokio::test]
  async fn test_sync_pending_data_notifies_clients() {
    let clients = Clients::new();
    let (_, mut rx) = clients.connect("http://localhost/index.html", ClientKind::Window).await;
    let queue = PendingQueue::in_memory().shared();
    queue.lock().unwrap().append("outbound", json!({"qty": 1})).unwrap();

    let worker: TestWorker = ServiceWorker::new(
      &config(),
      MemoryStorage::new(),
      online_fetcher(),
      clients,
      Some(queue.clone()),
    )
    .unwrap();

    let report = worker.handle_sync("sync-pending-data").await.unwrap().unwrap();
    assert_eq!(report.drained, 1);
    assert!(matches!(rx.try_recv().unwrap(), WorkerMessage::SyncComplete { .. }));
    assert!(rx.try_recv().is_err());
  }
}
