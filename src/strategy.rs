//! Caching strategies.
//!
//! Every strategy resolves to a response: network failures fall back to the
//! cache, then to the offline document or a synthetic 503. Cache write
//! failures are logged and never affect the response handed back.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, CacheStore, Partition};
use crate::http::{Request, Response, ResponseSource, ResponseType};
use crate::network::Fetch;
use crate::router::{Dispatch, Strategy};

pub struct Strategies<S: CacheStorage, F: Fetch> {
  store: CacheStore<S>,
  fetcher: F,
  offline_document: Request,
  timeout: Duration,
}

impl<S: CacheStorage, F: Fetch> Strategies<S, F> {
  pub fn new(store: CacheStore<S>, fetcher: F, offline_document: Request, timeout: Duration) -> Self {
    Self {
      store,
      fetcher,
      offline_document,
      timeout,
    }
  }

  pub fn store(&self) -> &CacheStore<S> {
    &self.store
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  /// Run whichever strategy the router picked.
  pub async fn respond(&self, request: &Request, dispatch: Dispatch) -> Option<Response> {
    match dispatch {
      Dispatch::Passthrough => None,
      Dispatch::Respond {
        strategy: Strategy::CacheFirst,
        partition,
      } => Some(self.cache_first(request, partition).await),
      Dispatch::Respond {
        strategy: Strategy::NetworkFirst,
        partition,
      } => Some(self.network_first(request, partition).await),
    }
  }

  /// Serve from the partition, fetching and storing on a miss.
  ///
  /// 1. Cache hit - return immediately, no network
  /// 2. Miss - fetch; same-origin 200 responses are stored
  /// 3. Network failure - offline document
  pub async fn cache_first(&self, request: &Request, partition: Partition) -> Response {
    match self.lookup(request, partition) {
      Some(cached) => {
        debug!(url = %request.url, %partition, "Cache hit");
        return cached;
      }
      None => debug!(url = %request.url, %partition, "Cache miss"),
    }

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_ok() && response.response_type == ResponseType::Basic {
          self.write_through(partition, request, &response);
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network unavailable, serving offline document");
        self.offline_response()
      }
    }
  }

  /// Prefer the network, falling back to the partition.
  ///
  /// 1. Fetch - 200 responses are stored, then returned
  /// 2. Network failure - cached copy from the same partition
  /// 3. Nothing cached - offline document for navigations, 503 otherwise
  pub async fn network_first(&self, request: &Request, partition: Partition) -> Response {
    match self.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.write_through(partition, request, &response);
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network unavailable, trying cache");

        if let Some(cached) = self.lookup(request, partition) {
          return cached;
        }

        if request.is_navigation() {
          self.offline_response()
        } else {
          Response::service_unavailable()
        }
      }
    }
  }

  /// Network fetch bounded by the configured timeout.
  async fn fetch(&self, request: &Request) -> Result<Response> {
    tokio::time::timeout(self.timeout, self.fetcher.fetch(request))
      .await
      .map_err(|_| eyre!("Fetch of {} timed out after {:?}", request.url, self.timeout))?
  }

  fn lookup(&self, request: &Request, partition: Partition) -> Option<Response> {
    let result = self
      .store
      .open(partition)
      .and_then(|cache| cache.match_request(request));

    match result {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %request.url, %partition, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  fn write_through(&self, partition: Partition, request: &Request, response: &Response) {
    let result = self
      .store
      .open(partition)
      .and_then(|cache| cache.put(request, response));

    if let Err(e) = result {
      warn!(url = %request.url, %partition, error = %e, "Failed to cache response");
    }
  }

  /// The offline document from any current partition, or a 503 if it was never cached.
  fn offline_response(&self) -> Response {
    match self.store.match_any(&self.offline_document) {
      Ok(Some(document)) => document.with_source(ResponseSource::OfflineFallback),
      Ok(None) => {
        warn!(url = %self.offline_document.url, "Offline document is not cached");
        Response::service_unavailable()
      }
      Err(e) => {
        warn!(error = %e, "Failed to read offline document");
        Response::service_unavailable()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheNames, MemoryStorage};
  use crate::testing::{BrokenStorage, HangingFetcher, ScriptedFetcher};
  use url::Url;

  const OFFLINE: &str = "http://localhost/offline.html";

  fn strategies(fetcher: ScriptedFetcher) -> Strategies<MemoryStorage, ScriptedFetcher> {
    let store = CacheStore::new(MemoryStorage::new(), CacheNames::new("ksi-osp", "v1"));
    Strategies::new(
      store,
      fetcher,
      Request::get(Url::parse(OFFLINE).unwrap()),
      Duration::from_secs(5),
    )
  }

  fn seed_offline_document(strategies: &Strategies<MemoryStorage, ScriptedFetcher>) {
    let cache = strategies.store().open(Partition::Static).unwrap();
    cache
      .put(
        &Request::get(Url::parse(OFFLINE).unwrap()),
        &Response::ok("<html>offline</html>"),
      )
      .unwrap();
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let strategies = strategies(ScriptedFetcher::new());
    let request = get("http://localhost/css/app.css");
    strategies
      .store()
      .open(Partition::Static)
      .unwrap()
      .put(&request, &Response::ok("cached css"))
      .unwrap();

    let response = strategies.cache_first(&request, Partition::Static).await;

    assert_eq!(response.text(), "cached css");
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(strategies.fetcher().calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_stores_then_serves_offline() {
    let fetcher =
      ScriptedFetcher::new().with("http://localhost/css/app.css", Response::ok("body {}"));
    let strategies = strategies(fetcher);
    let request = get("http://localhost/css/app.css");

    let response = strategies.cache_first(&request, Partition::Static).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.source, ResponseSource::Network);

    strategies.fetcher().set_offline(true);
    let response = strategies.cache_first(&request, Partition::Static).await;
    assert_eq!(response.text(), "body {}");
    assert_eq!(response.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_cross_origin() {
    let fetcher = ScriptedFetcher::new().with(
      "http://cdn.example.com/lib.js",
      Response::ok("lib").with_type(ResponseType::Cors),
    );
    let strategies = strategies(fetcher);
    let request = get("http://cdn.example.com/lib.js");

    let response = strategies.cache_first(&request, Partition::Static).await;

    assert_eq!(response.text(), "lib");
    assert!(strategies
      .store()
      .open(Partition::Static)
      .unwrap()
      .is_empty()
      .unwrap());
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_serves_offline_document() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_offline(true);
    let strategies = strategies(fetcher);
    seed_offline_document(&strategies);

    let response = strategies
      .cache_first(&get("http://localhost/img/logo.png"), Partition::Static)
      .await;

    assert_eq!(response.text(), "<html>offline</html>");
    assert_eq!(response.source, ResponseSource::OfflineFallback);
  }

  #[tokio::test]
  async fn test_network_first_writes_through() {
    let fetcher = ScriptedFetcher::new().with(
      "http://localhost/api/orders",
      Response::ok(r#"{"orders":[1,2]}"#),
    );
    let strategies = strategies(fetcher);
    let request = get("http://localhost/api/orders");

    let online = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(online.text(), r#"{"orders":[1,2]}"#);

    strategies.fetcher().set_offline(true);
    let offline = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(offline.body, online.body);
    assert_eq!(offline.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_network_first_prefers_fresh_network_copy() {
    let fetcher = ScriptedFetcher::new().with("http://localhost/api/stock", Response::ok("old"));
    let strategies = strategies(fetcher);
    let request = get("http://localhost/api/stock");

    strategies.network_first(&request, Partition::Data).await;
    strategies
      .fetcher()
      .set("http://localhost/api/stock", Response::ok("new"));

    let response = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(response.text(), "new");

    strategies.fetcher().set_offline(true);
    let response = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(response.text(), "new");
  }

  #[tokio::test]
  async fn test_network_first_error_status_is_not_cached() {
    let fetcher =
      ScriptedFetcher::new().with("http://localhost/api/broken", Response::new(500, "boom"));
    let strategies = strategies(fetcher);
    let request = get("http://localhost/api/broken");

    let response = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(response.status, 500);

    strategies.fetcher().set_offline(true);
    let response = strategies.network_first(&request, Partition::Data).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_offline_miss_distinguishes_navigation() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_offline(true);
    let strategies = strategies(fetcher);
    seed_offline_document(&strategies);

    let page = Request::navigate(Url::parse("http://localhost/m_9_2_0.html").unwrap());
    let response = strategies.network_first(&page, Partition::Dynamic).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "<html>offline</html>");

    let api = get("http://localhost/api/items");
    let response = strategies.network_first(&api, Partition::Data).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.text(), "Offline");
  }

  #[tokio::test]
  async fn test_missing_offline_document_yields_503() {
    let fetcher = ScriptedFetcher::new();
    fetcher.set_offline(true);
    let strategies = strategies(fetcher);

    let page = Request::navigate(Url::parse("http://localhost/index.html").unwrap());
    let response = strategies.network_first(&page, Partition::Dynamic).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_passthrough_produces_no_response() {
    let strategies = strategies(ScriptedFetcher::new());
    let response = strategies
      .respond(&get("http://localhost/x"), Dispatch::Passthrough)
      .await;
    assert!(response.is_none());
    assert_eq!(strategies.fetcher().calls(), 0);
  }

  #[tokio::test]
  async fn test_hanging_network_times_out_into_fallback() {
    let store = CacheStore::new(MemoryStorage::new(), CacheNames::new("ksi-osp", "v1"));
    let strategies = Strategies::new(
      store,
      HangingFetcher,
      Request::get(Url::parse(OFFLINE).unwrap()),
      Duration::from_millis(20),
    );

    let api = get("http://localhost/api/items");
    let response = strategies.network_first(&api, Partition::Data).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthetic);

    let asset = get("http://localhost/img/logo.png");
    let response = strategies.cache_first(&asset, Partition::Static).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_storage_failure_still_returns_network_response() {
    let fetcher = ScriptedFetcher::new()
      .with("http://localhost/api/items", Response::ok("net"))
      .with("http://localhost/css/app.css", Response::ok("css"));
    let store = CacheStore::new(BrokenStorage, CacheNames::new("ksi-osp", "v1"));
    let strategies = Strategies::new(
      store,
      fetcher,
      Request::get(Url::parse(OFFLINE).unwrap()),
      Duration::from_secs(5),
    );

    let response = strategies
      .network_first(&get("http://localhost/api/items"), Partition::Data)
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "net");

    let response = strategies
      .cache_first(&get("http://localhost/css/app.css"), Partition::Static)
      .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "css");

    strategies.fetcher().set_offline(true);
    let response = strategies
      .network_first(&get("http://localhost/api/items"), Partition::Data)
      .await;
    assert_eq!(response.status, 503);
  }
}
