//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{Request, Response};

/// The three kinds of cache the worker keeps per version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Asset manifest, filled eagerly at install time
  Static,
  /// HTML navigations, filled as pages are served
  Dynamic,
  /// API responses, filled as calls succeed
  Data,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::Static, Partition::Dynamic, Partition::Data];

  pub fn kind(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Dynamic => "dynamic",
      Partition::Data => "data",
    }
  }
}

impl std::fmt::Display for Partition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.kind())
  }
}

/// A stored request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Hash of method + URL
  pub request_key: String,
  pub method: String,
  pub url: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn new(request: &Request, response: &Response) -> Self {
    Self {
      request_key: request.cache_key(),
      method: request.method.to_string(),
      url: request.url.to_string(),
      response: response.clone(),
      cached_at: Utc::now(),
    }
  }
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Writing into a cache that
/// does not exist yet creates it.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist.
  fn open_cache(&self, name: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Names of every cache, in creation order.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and all of its entries. Returns false if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Look up an entry by request key.
  fn get_entry(&self, cache: &str, request_key: &str) -> Result<Option<CachedEntry>>;

  /// Insert or replace a single entry.
  fn put_entry(&self, cache: &str, entry: &CachedEntry) -> Result<()>;

  /// Insert or replace several entries atomically: either all are written or none.
  fn put_entries(&self, cache: &str, entries: &[CachedEntry]) -> Result<()>;

  /// Number of entries in the named cache (0 if missing).
  fn entry_count(&self, cache: &str) -> Result<usize>;
}
