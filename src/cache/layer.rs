//! Versioned cache partitions on top of a storage backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{CacheStorage, CachedEntry, Partition};
use crate::http::{Request, Response};
use crate::network::Fetch;

/// Derives cache names from the namespace prefix and current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  prefix: String,
  version: String,
}

impl CacheNames {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// `<prefix>-<kind>-<version>`
  pub fn name(&self, partition: Partition) -> String {
    format!("{}-{}-{}", self.prefix, partition.kind(), self.version)
  }

  pub fn current(&self) -> [String; 3] {
    Partition::ALL.map(|p| self.name(p))
  }

  /// Whether a cache belongs to this worker's namespace (any version).
  pub fn is_namespaced(&self, name: &str) -> bool {
    name.starts_with(&format!("{}-", self.prefix))
  }
}

/// Cache store holding the three partitions of the current version.
///
/// Cloning is cheap; all clones share the same backend.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
  names: CacheNames,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: S, names: CacheNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  /// Open (creating if needed) one partition of the current version.
  pub fn open(&self, partition: Partition) -> Result<PartitionHandle<S>> {
    let name = self.names.name(partition);
    self.storage.open_cache(&name)?;

    Ok(PartitionHandle {
      storage: Arc::clone(&self.storage),
      partition,
      name,
    })
  }

  /// Whether the partition holds an entry for every one of `requests`.
  pub fn holds_all(&self, partition: Partition, requests: &[Request]) -> Result<bool> {
    let name = self.names.name(partition);
    if !self.storage.has_cache(&name)? {
      return Ok(false);
    }

    for request in requests {
      if self.storage.get_entry(&name, &request.cache_key())?.is_none() {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Search every current partition, static first.
  pub fn match_any(&self, request: &Request) -> Result<Option<Response>> {
    let key = request.cache_key();
    for name in self.names.current() {
      if let Some(entry) = self.storage.get_entry(&name, &key)? {
        return Ok(Some(entry.response));
      }
    }
    Ok(None)
  }

  /// Delete every namespaced cache that is not one of the current three.
  ///
  /// Returns the names that were removed.
  pub fn delete_stale(&self) -> Result<Vec<String>> {
    let current = self.names.current();
    let mut deleted = Vec::new();

    for name in self.storage.cache_names()? {
      if !self.names.is_namespaced(&name) || current.contains(&name) {
        continue;
      }

      info!(cache = %name, "Deleting old cache");
      if self.storage.delete_cache(&name)? {
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// All caches in the backend with their entry counts.
  pub fn cache_names(&self) -> Result<Vec<(String, usize)>> {
    self
      .storage
      .cache_names()?
      .into_iter()
      .map(|name| {
        let count = self.storage.entry_count(&name)?;
        Ok((name, count))
      })
      .collect()
  }
}

impl<S: CacheStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}

/// An opened partition.
pub struct PartitionHandle<S: CacheStorage> {
  storage: Arc<S>,
  partition: Partition,
  name: String,
}

impl<S: CacheStorage> PartitionHandle<S> {
  pub fn partition(&self) -> Partition {
    self.partition
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.entry_count(&self.name)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Look up a stored response for this request.
  pub fn match_request(&self, request: &Request) -> Result<Option<Response>> {
    let entry = self.storage.get_entry(&self.name, &request.cache_key())?;
    Ok(entry.map(|e| e.response))
  }

  /// Store a copy of the response. Only GET requests with a 200 response are
  /// kept; anything else is skipped and `false` returned.
  pub fn put(&self, request: &Request, response: &Response) -> Result<bool> {
    if request.method != Method::GET || !response.is_ok() {
      debug!(url = %request.url, status = response.status, "Not caching response");
      return Ok(false);
    }

    self
      .storage
      .put_entry(&self.name, &CachedEntry::new(request, response))?;
    Ok(true)
  }

  /// Fetch every request and store all responses, or store nothing.
  ///
  /// Fails if any fetch fails or returns a status other than 200.
  pub async fn add_all<F: Fetch>(&self, fetcher: &F, requests: &[Request]) -> Result<usize> {
    let responses = try_join_all(requests.iter().map(|request| fetch_ok(fetcher, request))).await?;

    let entries: Vec<CachedEntry> = requests
      .iter()
      .zip(&responses)
      .map(|(request, response)| CachedEntry::new(request, response))
      .collect();

    self.storage.put_entries(&self.name, &entries)?;
    Ok(entries.len())
  }
}

async fn fetch_ok<F: Fetch>(fetcher: &F, request: &Request) -> Result<Response> {
  let response = fetcher.fetch(request).await?;
  if !response.is_ok() {
    return Err(eyre!(
      "Request for {} failed with status {}",
      request.url,
      response.status
    ));
  }
  Ok(response)
}
