//! Cache storage implementations: SQLite for persistence, memory for ephemeral runs.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedEntry};
use crate::http::{Response, ResponseSource, ResponseType};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A database that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named caches, one row per partition and version
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, request_key),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(cache_name, url);
"#;

fn insert_entry(conn: &Connection, cache: &str, entry: &CachedEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, status_text, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache,
        entry.request_key,
        entry.method,
        entry.url,
        entry.response.status,
        entry.response.status_text,
        headers,
        entry.response.body,
        entry.response.response_type.as_str(),
        entry.cached_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;
    Ok(())
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    let found: Option<i64> = self
      .conn()?
      .query_row("SELECT 1 FROM caches WHERE name = ?", params![name], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, cache: &str, request_key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, status_text, headers, body, response_type, cached_at
         FROM cache_entries WHERE cache_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (String, String, u16, String, String, Vec<u8>, String, String);
    let row: Option<Row> = stmt
      .query_row(params![cache, request_key], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    let Some((method, url, status, status_text, headers, body, response_type, cached_at)) = row
    else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", url, e))?;
    let response_type = ResponseType::parse(&response_type)
      .ok_or_else(|| eyre!("Unknown response type '{}' for {}", response_type, url))?;

    Ok(Some(CachedEntry {
      request_key: request_key.to_string(),
      method,
      response: Response {
        status,
        status_text,
        headers,
        body,
        response_type,
        source: ResponseSource::Cache,
      },
      cached_at: parse_datetime(&cached_at)?,
      url,
    }))
  }

  fn put_entry(&self, cache: &str, entry: &CachedEntry) -> Result<()> {
    let conn = self.conn()?;
    insert_entry(&conn, cache, entry)
  }

  fn put_entries(&self, cache: &str, entries: &[CachedEntry]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      // Dropping the transaction on error rolls everything back
      insert_entry(&tx, cache, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", cache, e))?;

    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by `insert_entry`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Storage that keeps everything in process memory.
/// Used for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<Vec<(String, BTreeMap<String, CachedEntry>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn caches(&self) -> Result<MutexGuard<'_, Vec<(String, BTreeMap<String, CachedEntry>)>>> {
    self.caches.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn find_or_create<'a>(
  caches: &'a mut Vec<(String, BTreeMap<String, CachedEntry>)>,
  name: &str,
) -> &'a mut BTreeMap<String, CachedEntry> {
  let index = match caches.iter().position(|(n, _)| n == name) {
    Some(i) => i,
    None => {
      caches.push((name.to_string(), BTreeMap::new()));
      caches.len() - 1
    }
  };
  &mut caches[index].1
}

impl CacheStorage for MemoryStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    let mut caches = self.caches()?;
    find_or_create(&mut caches, name);
    Ok(())
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    Ok(self.caches()?.iter().any(|(n, _)| n == name))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(self.caches()?.iter().map(|(n, _)| n.clone()).collect())
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut caches = self.caches()?;
    let before = caches.len();
    caches.retain(|(n, _)| n != name);
    Ok(caches.len() != before)
  }

  fn get_entry(&self, cache: &str, request_key: &str) -> Result<Option<CachedEntry>> {
    let caches = self.caches()?;
    let entry = caches
      .iter()
      .find(|(n, _)| n == cache)
      .and_then(|(_, entries)| entries.get(request_key))
      .cloned()
      .map(|mut entry| {
        entry.response.source = ResponseSource::Cache;
        entry
      });

    Ok(entry)
  }

  fn put_entry(&self, cache: &str, entry: &CachedEntry) -> Result<()> {
    let mut caches = self.caches()?;
    find_or_create(&mut caches, cache).insert(entry.request_key.clone(), entry.clone());
    Ok(())
  }

  fn put_entries(&self, cache: &str, entries: &[CachedEntry]) -> Result<()> {
    // One lock hold: readers never see part of a batch
    let mut caches = self.caches()?;
    let target = find_or_create(&mut caches, cache);
    for entry in entries {
      target.insert(entry.request_key.clone(), entry.clone());
    }
    Ok(())
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    Ok(
      self
        .caches()?
        .iter()
        .find(|(n, _)| n == cache)
        .map(|(_, entries)| entries.len())
        .unwrap_or(0),
    )
  }
}
