//! Test doubles shared by the module tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::{CacheStorage, CachedEntry};
use crate::http::{Request, Response};
use crate::network::Fetch;

/// A network that answers from a fixed table and can be switched offline.
#[derive(Default)]
pub struct ScriptedFetcher {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(self, url: &str, response: Response) -> Self {
    self.set(url, response);
    self
  }

  pub fn set(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Number of fetches attempted, including failed ones.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Fetch for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let response = self.responses.lock().unwrap().get(request.url.as_str()).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "Not Found")))
  }
}

/// A network whose requests never complete.
pub struct HangingFetcher;

impl Fetch for HangingFetcher {
  async fn fetch(&self, _request: &Request) -> Result<Response> {
    std::future::pending().await
  }
}

/// A cache backend where every operation fails.
pub struct BrokenStorage;

impl BrokenStorage {
  fn fail<T>(&self, cache: &str) -> Result<T> {
    Err(eyre!("Failed to access cache {}: disk I/O error", cache))
  }
}

impl CacheStorage for BrokenStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    self.fail(name)
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    self.fail(name)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    self.fail("*")
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    self.fail(name)
  }

  fn get_entry(&self, cache: &str, _request_key: &str) -> Result<Option<CachedEntry>> {
    self.fail(cache)
  }

  fn put_entry(&self, cache: &str, _entry: &CachedEntry) -> Result<()> {
    self.fail(cache)
  }

  fn put_entries(&self, cache: &str, _entries: &[CachedEntry]) -> Result<()> {
    self.fail(cache)
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    self.fail(cache)
  }
}
