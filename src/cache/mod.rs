//! Named, versioned response caches.
//!
//! This module provides the worker's cache store:
//! - Three partitions (static, dynamic, data) per deployment version
//! - Request identity by method + URL, GET/200 responses only
//! - Pruning of caches left behind by older versions on activation
//! - SQLite persistence, or process memory for ephemeral runs

mod layer;
mod storage;
mod traits;

pub use layer::{CacheNames, CacheStore, PartitionHandle};
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheStorage, CachedEntry, Partition};
