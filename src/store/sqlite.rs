//! SQLite-backed persistent store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Cached, Store, StoredEntry};
use crate::error::{Error, Result};

/// Schema for the cache table.
///
/// `cached_at` doubles as the freshness marker: NULL means the value is
/// retained but stale by definition, so the next lookup refetches.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT,
    PRIMARY KEY (entity_type, entity_key)
);
"#;

/// SQLite store; one connection guarded by a mutex, shared across
/// repositories via `Arc`.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (and migrate) the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (and migrate) the store at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// In-memory store for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::Storage(format!("failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("failed to run cache migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Default database path, under the platform data directory.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("could not determine data directory".into()))?;

    Ok(data_dir.join("mixtape").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))
  }
}

#[async_trait]
impl<T: Cached> Store<T> for SqliteStore {
  async fn read(&self, id: &str) -> Result<Option<StoredEntry<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, Option<String>)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("failed to read entity {}: {}", id, e)))?;

    let (data, cached_at) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    let value: T = serde_json::from_slice(&data)
      .map_err(|e| Error::Storage(format!("failed to deserialize entity {}: {}", id, e)))?;
    let cached_at = cached_at.as_deref().map(parse_datetime).transpose()?;

    Ok(Some(StoredEntry { value, cached_at }))
  }

  async fn write(&self, id: &str, value: &T, cached_at: DateTime<Utc>) -> Result<()> {
    let data = serde_json::to_vec(value)
      .map_err(|e| Error::Storage(format!("failed to serialize entity {}: {}", id, e)))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![T::entity_type(), id, data, cached_at.to_rfc3339()],
      )
      .map_err(|e| Error::Storage(format!("failed to store entity {}: {}", id, e)))?;

    Ok(())
  }

  async fn clear_freshness(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE entity_cache SET cached_at = NULL
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), id],
      )
      .map_err(|e| Error::Storage(format!("failed to clear freshness for {}: {}", id, e)))?;

    Ok(())
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("failed to parse datetime '{}': {}", s, e)))
}
