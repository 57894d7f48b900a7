//! Generic fetch/cache/convert engine.
//!
//! A [`Repository`] reconciles one entity type between the remote service
//! and the local store, and publishes per-id state into weakly-owned cells
//! observers subscribe to. The cache decision is store-first with a TTL:
//! remote fetch on miss or staleness, persist the converted result,
//! publish, return.
//!
//! Single-flight: concurrent `get` calls for one id elect exactly one
//! fetcher through the cell's atomic refresh claim; everyone else awaits the
//! cell and shares the winner's value or error. Network fetches happen
//! outside any store transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheState, CellMap, Claim, StateCell};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::remote::SourceClient;
use crate::retry::{self, BackoffPolicy, FixedBackoff};
use crate::store::Store;

/// Conversion seam between the remote and local representations.
///
/// `from_remote` failures are terminal for that id (`Error::Malformed`) and
/// never retried.
pub trait FromRemote: Clone + Send + Sync + Sized + 'static {
  type Remote: Send;

  fn from_remote(remote: Self::Remote) -> Result<Self>;

  /// The entity's id, used as the cache key.
  fn id(&self) -> &str;

  /// Entity-specific expiry, overriding the repository TTL when present.
  fn expires_at(&self) -> Option<DateTime<Utc>> {
    None
  }
}

struct Inner<L, C, S> {
  client: C,
  store: S,
  cells: CellMap<L>,
  backoff: Arc<dyn BackoffPolicy>,
  stale_after: chrono::Duration,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Fetch/cache engine for one entity type, cheap to clone and share.
pub struct Repository<L, C, S>
where
  L: FromRemote,
  C: SourceClient<Remote = L::Remote>,
  S: Store<L>,
{
  inner: Arc<Inner<L, C, S>>,
}

impl<L, C, S> Clone for Repository<L, C, S>
where
  L: FromRemote,
  C: SourceClient<Remote = L::Remote>,
  S: Store<L>,
{
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<L, C, S> Repository<L, C, S>
where
  L: FromRemote,
  C: SourceClient<Remote = L::Remote> + 'static,
  S: Store<L> + 'static,
{
  pub fn new(client: C, store: S, config: &Config) -> Self {
    Self {
      inner: Arc::new(Inner {
        client,
        store,
        cells: CellMap::new(),
        backoff: Arc::new(FixedBackoff::from_millis(&config.sync.backoff_ms)),
        stale_after: config.stale_after(),
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Swap the retry policy. Tests use zero-delay or empty schedules.
  pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
    Arc::get_mut(&mut self.inner)
      .expect("with_backoff must be called before the repository is shared")
      .backoff = backoff;
    self
  }

  pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
    Arc::get_mut(&mut self.inner)
      .expect("with_stale_after must be called before the repository is shared")
      .stale_after = stale_after;
    self
  }

  pub(crate) fn client(&self) -> &C {
    &self.inner.client
  }

  fn is_fresh(&self, value: &L, cached_at: DateTime<Utc>) -> bool {
    let now = Utc::now();
    match value.expires_at() {
      Some(expires) => now < expires,
      None => now - cached_at <= self.inner.stale_after,
    }
  }

  /// Get an entity, serving the local store when fresh.
  pub async fn get(&self, id: &str) -> Result<L> {
    self.get_with(id, true).await
  }

  /// Get an entity; `allow_cache = false` always goes to the remote (or
  /// joins a fetch already in flight).
  pub async fn get_with(&self, id: &str, allow_cache: bool) -> Result<L> {
    if allow_cache {
      if let Some(entry) = self.inner.store.read(id).await? {
        if let Some(cached_at) = entry.cached_at {
          if self.is_fresh(&entry.value, cached_at) {
            debug!(id, "serving fresh entity from store");
            if let Some(cell) = self.inner.cells.get(id) {
              cell.publish_loaded_unless_refreshing(entry.value.clone(), cached_at);
            }
            return Ok(entry.value);
          }
        }
      }
    }

    let (cell, _created) = self.inner.cells.get_or_create(id);
    loop {
      match cell.begin_refresh(|value, cached_at| allow_cache && self.is_fresh(value, cached_at)) {
        Claim::Reused { value, .. } => return Ok(value),
        Claim::InFlight => match cell.settled().await {
          CacheState::Loaded { value, .. } => return Ok(value),
          CacheState::Failed { error } => return Err(error),
          // The winner vanished without settling; contend again.
          CacheState::Refreshing => continue,
        },
        Claim::Claimed => {
          return match self.fetch_and_store(id).await {
            Ok((value, cached_at)) => {
              cell.publish(CacheState::loaded(value.clone(), cached_at));
              Ok(value)
            }
            Err(error) => {
              cell.publish(CacheState::Failed {
                error: error.clone(),
              });
              Err(error)
            }
          };
        }
      }
    }
  }

  async fn fetch_and_store(&self, id: &str) -> Result<(L, DateTime<Utc>)> {
    debug!(id, "fetching entity from remote");
    let remote = retry::run(self.inner.backoff.as_ref(), || {
      self.inner.client.fetch_one(id)
    })
    .await?;

    let value = L::from_remote(remote)?;
    let cached_at = Utc::now();
    self.inner.store.write(id, &value, cached_at).await?;
    Ok((value, cached_at))
  }

  /// Get several entities, preferring the store, batch-fetching the rest in
  /// parallel chunks.
  ///
  /// Every unresolved id goes through its cell's refresh claim first: an id
  /// whose fetch is already in flight joins that fetch instead of entering
  /// the batch, so the per-key single-fetch guarantee holds across `get` and
  /// `get_many`.
  ///
  /// The result preserves input order. A failed chunk or a missing or
  /// malformed id never aborts the others: those ids are dropped from the
  /// result, their failure published to any live cells. Local storage
  /// failures abort the whole call.
  pub async fn get_many(&self, ids: &[String]) -> Result<Vec<L>> {
    let mut resolved: HashMap<String, L> = HashMap::new();
    let mut claimed: Vec<(String, Arc<StateCell<L>>)> = Vec::new();
    let mut joined: Vec<(String, Arc<StateCell<L>>)> = Vec::new();

    for id in ids {
      if resolved.contains_key(id)
        || claimed.iter().any(|(c, _)| c == id)
        || joined.iter().any(|(j, _)| j == id)
      {
        continue;
      }
      if let Some(entry) = self.inner.store.read(id).await? {
        if let Some(cached_at) = entry.cached_at {
          if self.is_fresh(&entry.value, cached_at) {
            if let Some(cell) = self.inner.cells.get(id) {
              cell.publish_loaded_unless_refreshing(entry.value.clone(), cached_at);
            }
            resolved.insert(id.clone(), entry.value);
            continue;
          }
        }
      }
      let (cell, _created) = self.inner.cells.get_or_create(id);
      match cell.begin_refresh(|value, cached_at| self.is_fresh(value, cached_at)) {
        Claim::Reused { value, .. } => {
          resolved.insert(id.clone(), value);
        }
        Claim::InFlight => joined.push((id.clone(), cell)),
        Claim::Claimed => claimed.push((id.clone(), cell)),
      }
    }

    // The claimed cells stay referenced here so the batch publishes below
    // cannot hit a reclaimed entry.
    let claimed_ids: Vec<String> = claimed.iter().map(|(id, _)| id.clone()).collect();
    let (fetched, storage_error) = self.fetch_many_and_store(&claimed_ids).await;
    resolved.extend(fetched);

    for (id, cell) in joined {
      match cell.settled().await {
        CacheState::Loaded { value, .. } => {
          resolved.insert(id, value);
        }
        // The joined fetch failed; the id is dropped like any other batch
        // failure.
        CacheState::Failed { .. } => {}
        // The fetcher vanished without settling; fall back to the
        // single-entity path.
        CacheState::Refreshing => match self.get(&id).await {
          Ok(value) => {
            resolved.insert(id, value);
          }
          Err(error @ Error::Storage(_)) => return Err(error),
          Err(_) => {}
        },
      }
    }

    if let Some(error) = storage_error {
      return Err(error);
    }

    Ok(
      ids
        .iter()
        .filter_map(|id| resolved.get(id).cloned())
        .collect(),
    )
  }

  /// Batch-fetch `ids` in `batch_limit`-sized chunks, chunks in parallel,
  /// persisting and publishing each converted entity.
  ///
  /// Per-id and per-chunk failures are isolated; the first storage failure
  /// is returned separately because it is fatal to the caller.
  async fn fetch_many_and_store(&self, ids: &[String]) -> (HashMap<String, L>, Option<Error>) {
    let mut out = HashMap::new();
    let mut storage_error = None;
    if ids.is_empty() {
      return (out, None);
    }

    let limit = self.inner.client.batch_limit().max(1);
    let chunk_results = join_all(ids.chunks(limit).map(|chunk| async move {
      let result = retry::run(self.inner.backoff.as_ref(), || {
        self.inner.client.fetch_many(chunk)
      })
      .await;
      (chunk, result)
    }))
    .await;

    for (chunk, result) in chunk_results {
      let remotes = match result {
        Ok(remotes) => remotes,
        Err(error) => {
          warn!(ids = ?chunk, error = %error, "batch fetch failed for chunk");
          for id in chunk {
            self.inner.cells.update(
              id,
              CacheState::Failed {
                error: error.clone(),
              },
            );
          }
          continue;
        }
      };

      if remotes.len() != chunk.len() {
        // A short reply would leave the unpaired ids refreshing forever.
        let error = Error::malformed(
          chunk.join(","),
          format!("batch returned {} items for {} ids", remotes.len(), chunk.len()),
        );
        warn!(ids = ?chunk, error = %error, "dropping mismatched batch reply");
        for id in chunk {
          self.inner.cells.update(
            id,
            CacheState::Failed {
              error: error.clone(),
            },
          );
        }
        continue;
      }

      for (id, remote) in chunk.iter().zip(remotes) {
        let error = match remote {
          Some(remote) => match L::from_remote(remote) {
            Ok(value) => {
              let cached_at = Utc::now();
              if let Err(error) = self.inner.store.write(id, &value, cached_at).await {
                storage_error.get_or_insert(error.clone());
                self.inner.cells.update(id, CacheState::Failed { error });
                continue;
              }
              self
                .inner
                .cells
                .update(id, CacheState::loaded(value.clone(), cached_at));
              out.insert(id.clone(), value);
              continue;
            }
            Err(error) => error,
          },
          None => Error::not_found(id.clone()),
        };
        warn!(id = %id, error = %error, "dropping entity from batch result");
        self.inner.cells.update(id, CacheState::Failed { error });
      }
    }

    (out, storage_error)
  }

  /// Clear the freshness marker so the next `get` refetches regardless of
  /// TTL. The persisted value is retained.
  pub async fn invalidate(&self, id: &str) -> Result<()> {
    self.inner.store.clear_freshness(id).await
  }

  pub async fn invalidate_many(&self, ids: &[String]) -> Result<()> {
    for id in ids {
      self.inner.store.clear_freshness(id).await?;
    }
    Ok(())
  }

  /// Live cells for reactive consumption, in input order.
  ///
  /// Only ids whose cells did not already exist are resolved, by one
  /// background task: store-fresh values are published directly, the rest
  /// are batch-fetched. The call returns immediately.
  pub fn states_of(&self, ids: &[String]) -> Vec<Arc<StateCell<L>>> {
    let (cells, created) = self.inner.cells.get_or_create_batch(ids);

    // Claim every new cell before handing them out, so concurrent `get`
    // calls join the background resolution instead of double-fetching. An
    // id whose claim was lost to a racing caller is already being fetched
    // there and must not enter the batch.
    let to_resolve: Vec<String> = created
      .into_iter()
      .filter(|id| {
        cells
          .get(id)
          .is_some_and(|cell| matches!(cell.begin_refresh(|_, _| false), Claim::Claimed))
      })
      .collect();

    if !to_resolve.is_empty() {
      let repo = self.clone();
      self.track(tokio::spawn(async move {
        repo.resolve_created(to_resolve).await;
      }));
    }

    ids
      .iter()
      .filter_map(|id| cells.get(id))
      .map(Arc::clone)
      .collect()
  }

  async fn resolve_created(&self, ids: Vec<String>) {
    let mut to_fetch = Vec::new();
    for id in ids {
      match self.inner.store.read(&id).await {
        Ok(Some(entry)) => {
          match entry.cached_at {
            Some(cached_at) if self.is_fresh(&entry.value, cached_at) => {
              self
                .inner
                .cells
                .update(&id, CacheState::loaded(entry.value, cached_at));
              continue;
            }
            _ => {}
          }
          to_fetch.push(id);
        }
        Ok(None) => to_fetch.push(id),
        Err(error) => {
          self.inner.cells.update(&id, CacheState::Failed { error });
        }
      }
    }

    let (_fetched, storage_error) = self.fetch_many_and_store(&to_fetch).await;
    if let Some(error) = storage_error {
      warn!(error = %error, "storage failure while resolving background cells");
    }
  }

  /// Persist and publish an entity obtained outside the `get` path (e.g.
  /// carried along in a library listing).
  pub async fn ingest(&self, remote: L::Remote) -> Result<L> {
    let value = L::from_remote(remote)?;
    let cached_at = Utc::now();
    self.inner.store.write(value.id(), &value, cached_at).await?;
    self
      .inner
      .cells
      .update(value.id(), CacheState::loaded(value.clone(), cached_at));
    Ok(value)
  }

  fn track(&self, handle: JoinHandle<()>) {
    let mut tasks = self
      .inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    tasks.retain(|h| !h.is_finished());
    tasks.push(handle);
  }

  /// Abort outstanding background tasks. Observers keep whatever state was
  /// last published.
  pub fn shutdown(&self) {
    let mut tasks = self
      .inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}
