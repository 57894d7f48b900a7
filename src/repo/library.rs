//! Saved-library repository: which entities the user has saved.
//!
//! Membership is tracked independently of whether the full entity has been
//! fetched: a per-id boolean cell presenters observe, plus an aggregate id
//! set with its own staleness clock, persisted as a snapshot. Mutation is
//! optimistic: the local cells and the aggregate set change before the
//! remote push resolves. A push that fails after retries rolls the change
//! back, so local and remote state never silently diverge.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::core::{FromRemote, Repository};
use crate::cache::{CacheState, CellMap, StateCell};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{LibraryEvent, LibraryEvents};
use crate::remote::LibraryClient;
use crate::retry::{self, BackoffPolicy, FixedBackoff};
use crate::store::{Cached, Store};

/// Storage key of the persisted library snapshot.
const SNAPSHOT_KEY: &str = "saved";

/// The persisted form of the aggregate saved-id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySnapshot {
  pub ids: Vec<String>,
}

impl Cached for LibrarySnapshot {
  fn entity_type() -> &'static str {
    "library"
  }
}

struct Inner<L, C, S, SS>
where
  L: FromRemote,
  C: LibraryClient<Remote = L::Remote>,
  S: Store<L>,
{
  repo: Repository<L, C, S>,
  snapshots: SS,
  saved_cells: CellMap<bool>,
  rating_cells: CellMap<Option<u8>>,
  set: Mutex<Option<(HashSet<String>, DateTime<Utc>)>>,
  events: LibraryEvents,
  backoff: Arc<dyn BackoffPolicy>,
  stale_after: chrono::Duration,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Repository specialization tracking the user's saved library.
pub struct SavedLibrary<L, C, S, SS>
where
  L: FromRemote,
  C: LibraryClient<Remote = L::Remote>,
  S: Store<L>,
{
  inner: Arc<Inner<L, C, S, SS>>,
}

impl<L, C, S, SS> Clone for SavedLibrary<L, C, S, SS>
where
  L: FromRemote,
  C: LibraryClient<Remote = L::Remote>,
  S: Store<L>,
{
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<L, C, S, SS> SavedLibrary<L, C, S, SS>
where
  L: FromRemote,
  C: LibraryClient<Remote = L::Remote> + 'static,
  S: Store<L> + 'static,
  SS: Store<LibrarySnapshot> + Send + Sync + 'static,
{
  pub fn new(repo: Repository<L, C, S>, snapshots: SS, config: &Config) -> Self {
    Self {
      inner: Arc::new(Inner {
        repo,
        snapshots,
        saved_cells: CellMap::new(),
        rating_cells: CellMap::new(),
        set: Mutex::new(None),
        events: LibraryEvents::default(),
        backoff: Arc::new(FixedBackoff::from_millis(&config.sync.backoff_ms)),
        stale_after: config.library_stale_after(),
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
    Arc::get_mut(&mut self.inner)
      .expect("with_backoff must be called before the library is shared")
      .backoff = backoff;
    self
  }

  /// The underlying full-entity repository.
  pub fn entities(&self) -> &Repository<L, C, S> {
    &self.inner.repo
  }

  /// Subscribe to membership and refresh events. Late subscribers only see
  /// future events.
  pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
    self.inner.events.subscribe()
  }

  fn is_fresh(&self, at: DateTime<Utc>) -> bool {
    Utc::now() - at <= self.inner.stale_after
  }

  fn set_lock(&self) -> std::sync::MutexGuard<'_, Option<(HashSet<String>, DateTime<Utc>)>> {
    self.inner.set.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// The set of saved entity ids, served from memory or the persisted
  /// snapshot when fresh.
  pub async fn library(&self) -> Result<HashSet<String>> {
    self.library_with(true).await
  }

  pub async fn library_with(&self, allow_cache: bool) -> Result<HashSet<String>> {
    if allow_cache {
      if let Some((set, at)) = self.set_lock().clone() {
        if self.is_fresh(at) {
          return Ok(set);
        }
      }

      if let Some(entry) = self.inner.snapshots.read(SNAPSHOT_KEY).await? {
        if let Some(at) = entry.cached_at {
          if self.is_fresh(at) {
            debug!(total = entry.value.ids.len(), "serving library from snapshot");
            let set: HashSet<String> = entry.value.ids.into_iter().collect();
            *self.set_lock() = Some((set.clone(), at));
            self
              .inner
              .saved_cells
              .compute_all(|key| CacheState::loaded(set.contains(key), at));
            return Ok(set);
          }
        }
      }
    }

    self.refresh_library().await
  }

  /// Fetch the full library from the remote, ingesting every entity through
  /// the entity repository, and replace the snapshot.
  async fn refresh_library(&self) -> Result<HashSet<String>> {
    let remotes = retry::run(self.inner.backoff.as_ref(), || {
      self.inner.repo.client().fetch_library()
    })
    .await?;

    let mut ids = Vec::with_capacity(remotes.len());
    for remote in remotes {
      match self.inner.repo.ingest(remote).await {
        Ok(value) => ids.push(value.id().to_string()),
        Err(err @ Error::Storage(_)) => return Err(err),
        Err(error) => warn!(error = %error, "skipping malformed library entry"),
      }
    }

    let now = Utc::now();
    self
      .inner
      .snapshots
      .write(SNAPSHOT_KEY, &LibrarySnapshot { ids: ids.clone() }, now)
      .await?;

    let set: HashSet<String> = ids.into_iter().collect();
    *self.set_lock() = Some((set.clone(), now));
    self
      .inner
      .saved_cells
      .compute_all(|key| CacheState::loaded(set.contains(key), now));

    self.inner.events.emit(LibraryEvent::LibraryRefreshed {
      total: set.len(),
    });
    Ok(set)
  }

  /// Whether `id` is in the user's library.
  pub async fn is_saved(&self, id: &str) -> Result<bool> {
    let flags = self.are_saved(std::slice::from_ref(&id.to_string())).await?;
    Ok(flags[0])
  }

  /// Membership for each id, in input order. Ids not already known are
  /// batch-checked against the remote, chunks in parallel, and cached as
  /// observable cells.
  pub async fn are_saved(&self, ids: &[String]) -> Result<Vec<bool>> {
    let mut known: HashMap<String, bool> = HashMap::new();
    let snapshot = self.set_lock().clone();

    for id in ids {
      if known.contains_key(id) {
        continue;
      }
      if let Some(flag) = self.inner.saved_cells.get_value(id) {
        known.insert(id.clone(), flag);
      } else if let Some((set, at)) = &snapshot {
        if self.is_fresh(*at) {
          known.insert(id.clone(), set.contains(id));
        }
      }
    }

    let mut unknown: Vec<String> = Vec::new();
    for id in ids {
      if !known.contains_key(id) && !unknown.contains(id) {
        unknown.push(id.clone());
      }
    }

    if !unknown.is_empty() {
      let limit = self.inner.repo.client().saved_batch_limit().max(1);
      let chunk_results = join_all(unknown.chunks(limit).map(|chunk| async move {
        let result = retry::run(self.inner.backoff.as_ref(), || {
          self.inner.repo.client().check_saved(chunk)
        })
        .await;
        (chunk, result)
      }))
      .await;

      let now = Utc::now();
      for (chunk, result) in chunk_results {
        // "couldn't check" must stay distinguishable from "not saved".
        let flags = result?;
        if flags.len() != chunk.len() {
          return Err(Error::malformed(
            chunk.join(","),
            format!("membership check returned {} flags for {} ids", flags.len(), chunk.len()),
          ));
        }
        for (id, flag) in chunk.iter().zip(flags) {
          let (cell, _) = self.inner.saved_cells.get_or_create(id);
          cell.publish(CacheState::loaded(flag, now));
          known.insert(id.clone(), flag);
        }
      }
    }

    ids
      .iter()
      .map(|id| {
        known
          .get(id)
          .copied()
          .ok_or_else(|| Error::malformed(id.clone(), "membership check left the id unresolved"))
      })
      .collect()
  }

  /// Live saved-membership cell for one id, seeded from the aggregate set
  /// when possible, otherwise resolved in the background.
  pub fn saved_state_of(&self, id: &str) -> Arc<StateCell<bool>> {
    let (cell, created) = self.inner.saved_cells.get_or_create(id);
    if created {
      let seeded = {
        let snapshot = self.set_lock();
        match snapshot.as_ref() {
          Some((set, at)) if self.is_fresh(*at) => {
            cell.publish(CacheState::loaded(set.contains(id), *at));
            true
          }
          _ => false,
        }
      };
      if !seeded {
        let library = self.clone();
        let id = id.to_string();
        self.track(tokio::spawn(async move {
          if let Err(error) = library.are_saved(std::slice::from_ref(&id)).await {
            library
              .inner
              .saved_cells
              .update(&id, CacheState::Failed { error });
          }
        }));
      }
    }
    cell
  }

  /// Add or remove ids from the library, optimistically.
  ///
  /// Cells and the aggregate set update before the remote push; a push
  /// failure (after retries) rolls the optimistic change back and surfaces
  /// the error. On success a `SetSaved` event is emitted exactly once.
  pub async fn set_saved(&self, ids: &[String], saved: bool) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    let now = Utc::now();

    // Remember what we are overwriting, for rollback. The cell is asked
    // first, then the aggregate set; an id known to neither stays unknown
    // rather than getting a made-up prior value.
    let previous: HashMap<String, Option<bool>> = {
      let snapshot = self.set_lock();
      ids
        .iter()
        .map(|id| {
          let prior = self
            .inner
            .saved_cells
            .get_value(id)
            .or_else(|| snapshot.as_ref().map(|(set, _)| set.contains(id)));
          (id.clone(), prior)
        })
        .collect()
    };

    {
      let mut snapshot = self.set_lock();
      if let Some((set, _)) = snapshot.as_mut() {
        for id in ids {
          if saved {
            set.insert(id.clone());
          } else {
            set.remove(id);
          }
        }
      }
    }
    for id in ids {
      self
        .inner
        .saved_cells
        .update(id, CacheState::loaded(saved, now));
    }

    let limit = self.inner.repo.client().saved_batch_limit().max(1);
    let mut push_result = Ok(());
    for chunk in ids.chunks(limit) {
      let result = retry::run(self.inner.backoff.as_ref(), || {
        self.inner.repo.client().push_saved(chunk, saved)
      })
      .await;
      if let Err(error) = result {
        push_result = Err(error);
        break;
      }
    }

    match push_result {
      Ok(()) => {
        self.persist_snapshot().await?;
        self.inner.events.emit(LibraryEvent::SetSaved {
          ids: ids.to_vec(),
          saved,
        });
        Ok(())
      }
      Err(error) => {
        warn!(error = %error, saved, "push failed, rolling back optimistic change");
        let rolled_back_at = Utc::now();
        {
          let mut snapshot = self.set_lock();
          if let Some((set, _)) = snapshot.as_mut() {
            for id in ids {
              match previous.get(id).copied().flatten() {
                Some(true) => {
                  set.insert(id.clone());
                }
                Some(false) => {
                  set.remove(id);
                }
                None => {}
              }
            }
          }
        }
        for id in ids {
          match previous.get(id).copied().flatten() {
            Some(was_saved) => {
              self
                .inner
                .saved_cells
                .update(id, CacheState::loaded(was_saved, rolled_back_at));
            }
            // No prior membership is known for this id; the failure replaces
            // the optimistic value instead of a fabricated one.
            None => {
              self.inner.saved_cells.update(
                id,
                CacheState::Failed {
                  error: error.clone(),
                },
              );
            }
          }
        }
        Err(error)
      }
    }
  }

  async fn persist_snapshot(&self) -> Result<()> {
    let snapshot = self.set_lock().clone();
    if let Some((set, at)) = snapshot {
      let mut ids: Vec<String> = set.into_iter().collect();
      ids.sort();
      self
        .inner
        .snapshots
        .write(SNAPSHOT_KEY, &LibrarySnapshot { ids }, at)
        .await?;
    }
    Ok(())
  }

  /// Live rating cell for one id.
  pub fn rating_state_of(&self, id: &str) -> Arc<StateCell<Option<u8>>> {
    let (cell, _) = self.inner.rating_cells.get_or_create(id);
    cell
  }

  /// Set or clear the user's rating, optimistically, with rollback on a
  /// failed push.
  pub async fn rate(&self, id: &str, rating: Option<u8>) -> Result<()> {
    let previous = self.inner.rating_cells.get_value(id);
    self
      .inner
      .rating_cells
      .update(id, CacheState::loaded(rating, Utc::now()));

    let result = retry::run(self.inner.backoff.as_ref(), || {
      self.inner.repo.client().push_rating(id, rating)
    })
    .await;

    if let Err(error) = result {
      warn!(id = %id, error = %error, "rating push failed, rolling back");
      match previous {
        Some(prior) => {
          self
            .inner
            .rating_cells
            .update(id, CacheState::loaded(prior, Utc::now()));
        }
        // No rating was known before; "unrated" must not be invented.
        None => {
          self.inner.rating_cells.update(
            id,
            CacheState::Failed {
              error: error.clone(),
            },
          );
        }
      }
      return Err(error);
    }
    Ok(())
  }

  /// Drop every locally cached rating at once.
  pub fn clear_ratings(&self) {
    let now = Utc::now();
    self
      .inner
      .rating_cells
      .compute_all(|_| CacheState::loaded(None, now));
    self.inner.events.emit(LibraryEvent::RatingsCleared);
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

  /// Abort background tasks here and in the entity repository.
  pub fn shutdown(&self) {
    let mut tasks = self
      .inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
    drop(tasks);
    self.inner.repo.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::time::Duration;
  use tokio::sync::Notify;

  use crate::remote::SourceClient;
  use crate::store::MemStore;

  #[derive(Debug, Clone)]
  struct RemoteTrack {
    id: String,
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Track {
    id: String,
  }

  impl Cached for Track {
    fn entity_type() -> &'static str {
      "track"
    }
  }

  impl FromRemote for Track {
    type Remote = RemoteTrack;

    fn from_remote(remote: RemoteTrack) -> Result<Self> {
      Ok(Track { id: remote.id })
    }

    fn id(&self) -> &str {
      &self.id
    }
  }

  #[derive(Default)]
  struct MockClient {
    library: Vec<String>,
    saved: Mutex<HashSet<String>>,
    check_calls: AtomicU32,
    push_calls: AtomicU32,
    fail_push: AtomicBool,
    short_check: AtomicBool,
    push_gate: Option<Arc<Notify>>,
  }

  impl MockClient {
    fn with_library(ids: &[&str]) -> Self {
      Self {
        library: ids.iter().map(|s| s.to_string()).collect(),
        saved: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
        ..Default::default()
      }
    }
  }

  #[async_trait]
  impl SourceClient for MockClient {
    type Remote = RemoteTrack;

    async fn fetch_one(&self, id: &str) -> Result<RemoteTrack> {
      Ok(RemoteTrack { id: id.to_string() })
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<RemoteTrack>>> {
      Ok(ids.iter().map(|id| Some(RemoteTrack { id: id.clone() })).collect())
    }
  }

  #[async_trait]
  impl LibraryClient for MockClient {
    fn saved_batch_limit(&self) -> usize {
      2
    }

    async fn fetch_library(&self) -> Result<Vec<RemoteTrack>> {
      Ok(
        self
          .library
          .iter()
          .map(|id| RemoteTrack { id: id.clone() })
          .collect(),
      )
    }

    async fn check_saved(&self, ids: &[String]) -> Result<Vec<bool>> {
      self.check_calls.fetch_add(1, Ordering::SeqCst);
      let saved = self.saved.lock().unwrap();
      let mut flags: Vec<bool> = ids.iter().map(|id| saved.contains(id)).collect();
      if self.short_check.load(Ordering::SeqCst) {
        flags.pop();
      }
      Ok(flags)
    }

    async fn push_saved(&self, ids: &[String], saved: bool) -> Result<()> {
      if let Some(gate) = &self.push_gate {
        gate.notified().await;
      }
      self.push_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_push.load(Ordering::SeqCst) {
        return Err(Error::Transport("push failed".into()));
      }
      let mut set = self.saved.lock().unwrap();
      for id in ids {
        if saved {
          set.insert(id.clone());
        } else {
          set.remove(id);
        }
      }
      Ok(())
    }

    async fn push_rating(&self, _id: &str, _rating: Option<u8>) -> Result<()> {
      if self.fail_push.load(Ordering::SeqCst) {
        return Err(Error::Transport("push failed".into()));
      }
      Ok(())
    }
  }

  type TestLibrary =
    SavedLibrary<Track, Arc<MockClient>, Arc<MemStore<Track>>, Arc<MemStore<LibrarySnapshot>>>;

  fn library(client: Arc<MockClient>) -> TestLibrary {
    let config = Config::default();
    let repo = Repository::new(client, Arc::new(MemStore::new()), &config)
      .with_backoff(Arc::new(FixedBackoff::none()));
    SavedLibrary::new(repo, Arc::new(MemStore::new()), &config)
      .with_backoff(Arc::new(FixedBackoff::none()))
  }

  #[tokio::test]
  async fn test_library_fetches_once_while_fresh() {
    let client = Arc::new(MockClient::with_library(&["t1", "t2"]));
    let lib = library(client.clone());

    let set = lib.library().await.unwrap();
    assert_eq!(set.len(), 2);
    assert!(set.contains("t1"));

    // Second call is served from memory; entities were ingested.
    lib.library().await.unwrap();
    assert_eq!(lib.entities().get("t1").await.unwrap().id, "t1");
  }

  #[tokio::test]
  async fn test_library_refresh_emits_event() {
    let client = Arc::new(MockClient::with_library(&["t1"]));
    let lib = library(client);
    let mut events = lib.subscribe();

    lib.library_with(false).await.unwrap();
    assert!(matches!(
      events.recv().await.unwrap(),
      LibraryEvent::LibraryRefreshed { total: 1 }
    ));
  }

  #[tokio::test]
  async fn test_are_saved_checks_only_unknown_ids_in_chunks() {
    let client = Arc::new(MockClient::with_library(&["t1"]));
    let lib = library(client.clone());

    let ids: Vec<String> = ["t1", "t2", "t3"].iter().map(|s| s.to_string()).collect();
    let flags = lib.are_saved(&ids).await.unwrap();
    assert_eq!(flags, vec![true, false, false]);
    // Batch limit 2: ["t1", "t2"] and ["t3"].
    assert_eq!(client.check_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_snapshot_answers_membership_without_remote_checks() {
    let client = Arc::new(MockClient::with_library(&["t1"]));
    let lib = library(client.clone());

    lib.library().await.unwrap();
    assert!(lib.is_saved("t1").await.unwrap());
    assert!(!lib.is_saved("t2").await.unwrap());
    assert_eq!(client.check_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_optimistic_save_visible_before_push_resolves() {
    let gate = Arc::new(Notify::new());
    let mut client = MockClient::with_library(&[]);
    client.push_gate = Some(gate.clone());
    let client = Arc::new(client);
    let lib = library(client.clone());

    lib.library().await.unwrap();
    let cell = lib.saved_state_of("t9");
    let mut events = lib.subscribe();

    let pending = {
      let lib = lib.clone();
      tokio::spawn(async move { lib.set_saved(&["t9".to_string()], true).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The push has not resolved, but the local state already says saved.
    assert_eq!(client.push_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cell.value(), Some(true));
    assert!(lib.is_saved("t9").await.unwrap());

    gate.notify_one();
    pending.await.unwrap().unwrap();

    // Exactly one SetSaved event, after remote confirmation.
    match events.recv().await.unwrap() {
      LibraryEvent::SetSaved { ids, saved } => {
        assert_eq!(ids, vec!["t9".to_string()]);
        assert!(saved);
      }
      other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(
      events.try_recv(),
      Err(broadcast::error::TryRecvError::Empty)
    ));
  }

  #[tokio::test]
  async fn test_failed_push_rolls_back() {
    let client = Arc::new(MockClient::with_library(&["t1"]));
    client.fail_push.store(true, Ordering::SeqCst);
    let lib = library(client.clone());

    lib.library().await.unwrap();
    let cell = lib.saved_state_of("t1");
    let mut events = lib.subscribe();

    let err = lib.set_saved(&["t1".to_string()], false).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // Membership is back to saved, and no event was emitted.
    assert_eq!(cell.value(), Some(true));
    assert!(lib.is_saved("t1").await.unwrap());
    assert!(matches!(
      events.try_recv(),
      Err(broadcast::error::TryRecvError::Empty)
    ));
  }

  #[tokio::test]
  async fn test_failed_resave_keeps_membership() {
    let client = Arc::new(MockClient::with_library(&["t1"]));
    client.fail_push.store(true, Ordering::SeqCst);
    let lib = library(client.clone());

    lib.library().await.unwrap();
    // "t1" is already saved; re-saving it fails at the remote.
    let err = lib.set_saved(&["t1".to_string()], true).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // The rollback restores the prior membership from the aggregate set
    // instead of flipping it to unsaved.
    assert!(lib.is_saved("t1").await.unwrap());
    assert!(client.saved.lock().unwrap().contains("t1"));
  }

  #[tokio::test]
  async fn test_failed_save_of_unknown_id_does_not_invent_membership() {
    let client = Arc::new(MockClient::with_library(&[]));
    client.fail_push.store(true, Ordering::SeqCst);
    let lib = library(client.clone());

    // No library loaded, no cell seeded: prior membership is unknown.
    let cell = lib.inner.saved_cells.get_or_create("t9").0;
    let err = lib.set_saved(&["t9".to_string()], true).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // The cell reports the failure rather than a made-up prior value.
    assert!(matches!(cell.get(), Some(CacheState::Failed { .. })));
    assert_eq!(cell.value(), None);
  }

  #[tokio::test]
  async fn test_failed_rate_does_not_invent_prior_rating() {
    let client = Arc::new(MockClient::with_library(&[]));
    client.fail_push.store(true, Ordering::SeqCst);
    let lib = library(client.clone());

    let cell = lib.rating_state_of("t1");
    let err = lib.rate("t1", Some(3)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // No rating was known before the attempt; the rollback must not claim
    // the track is unrated.
    assert!(matches!(cell.get(), Some(CacheState::Failed { .. })));
    assert_eq!(cell.value(), None);
  }

  #[tokio::test]
  async fn test_truncated_membership_reply_is_an_error() {
    let client = Arc::new(MockClient::with_library(&[]));
    client.short_check.store(true, Ordering::SeqCst);
    let lib = library(client);

    let ids: Vec<String> = ["t1", "t2"].iter().map(|s| s.to_string()).collect();
    let err = lib.are_saved(&ids).await.unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
  }

  #[tokio::test]
  async fn test_unsave_updates_set_and_persists_snapshot() {
    let client = Arc::new(MockClient::with_library(&["t1", "t2"]));
    let lib = library(client.clone());

    lib.library().await.unwrap();
    lib.set_saved(&["t1".to_string()], false).await.unwrap();

    assert!(!lib.is_saved("t1").await.unwrap());
    assert!(lib.is_saved("t2").await.unwrap());
    assert!(!client.saved.lock().unwrap().contains("t1"));
  }

  #[tokio::test]
  async fn test_rate_rolls_back_on_failure() {
    let client = Arc::new(MockClient::with_library(&[]));
    let lib = library(client.clone());

    let cell = lib.rating_state_of("t1");
    lib.rate("t1", Some(4)).await.unwrap();
    assert_eq!(cell.value(), Some(Some(4)));

    client.fail_push.store(true, Ordering::SeqCst);
    let err = lib.rate("t1", Some(1)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(cell.value(), Some(Some(4)));
  }

  #[tokio::test]
  async fn test_clear_ratings_bulk_invalidates() {
    let client = Arc::new(MockClient::with_library(&[]));
    let lib = library(client);
    let mut events = lib.subscribe();

    let a = lib.rating_state_of("a");
    let b = lib.rating_state_of("b");
    lib.rate("a", Some(5)).await.unwrap();
    lib.rate("b", Some(2)).await.unwrap();

    lib.clear_ratings();
    assert_eq!(a.value(), Some(None));
    assert_eq!(b.value(), Some(None));
    assert!(matches!(
      events.recv().await.unwrap(),
      LibraryEvent::RatingsCleared
    ));
  }
}
