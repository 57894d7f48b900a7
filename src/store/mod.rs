//! Persistent store collaborators.
//!
//! Repositories treat persistence as an external awaitable collaborator with
//! read/write-by-id primitives and a clearable freshness marker. The store
//! keeps its transactions to itself; the sync engine never holds one open
//! across a network round-trip.

mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use sqlite::SqliteStore;

/// Entities the SQLite store can persist.
pub trait Cached: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Type name for storage organization (e.g. "track", "album").
  fn entity_type() -> &'static str;
}

/// One persisted entry.
///
/// `cached_at` is the freshness marker: `None` means the value is retained
/// but must not be treated as fresh, regardless of TTL.
#[derive(Debug, Clone)]
pub struct StoredEntry<T> {
  pub value: T,
  pub cached_at: Option<DateTime<Utc>>,
}

/// Read/write-by-id persistence used by the repositories.
#[async_trait]
pub trait Store<T: Send + Sync>: Send + Sync {
  async fn read(&self, id: &str) -> Result<Option<StoredEntry<T>>>;

  async fn write(&self, id: &str, value: &T, cached_at: DateTime<Utc>) -> Result<()>;

  /// Null the freshness marker for `id`, keeping the value. The next cache
  /// decision for `id` will refetch.
  async fn clear_freshness(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<T, S> Store<T> for Arc<S>
where
  T: Send + Sync,
  S: Store<T> + ?Sized,
{
  async fn read(&self, id: &str) -> Result<Option<StoredEntry<T>>> {
    (**self).read(id).await
  }

  async fn write(&self, id: &str, value: &T, cached_at: DateTime<Utc>) -> Result<()> {
    (**self).write(id, value, cached_at).await
  }

  async fn clear_freshness(&self, id: &str) -> Result<()> {
    (**self).clear_freshness(id).await
  }
}

/// In-memory store for unit tests and ephemeral sessions.
pub struct MemStore<T> {
  entries: Mutex<HashMap<String, StoredEntry<T>>>,
}

impl<T: Clone> MemStore<T> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredEntry<T>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of persisted entries.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl<T: Clone> Default for MemStore<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<T: Clone + Send + Sync> Store<T> for MemStore<T> {
  async fn read(&self, id: &str) -> Result<Option<StoredEntry<T>>> {
    Ok(self.lock().get(id).cloned())
  }

  async fn write(&self, id: &str, value: &T, cached_at: DateTime<Utc>) -> Result<()> {
    self.lock().insert(
      id.to_string(),
      StoredEntry {
        value: value.clone(),
        cached_at: Some(cached_at),
      },
    );
    Ok(())
  }

  async fn clear_freshness(&self, id: &str) -> Result<()> {
    if let Some(entry) = self.lock().get_mut(id) {
      entry.cached_at = None;
    }
    Ok(())
  }
}
