//! Observable state cells and the weak cell map.
//!
//! A [`StateCell`] is a single-value observable holder for one cache key,
//! built on a `tokio::sync::watch` channel: readers never block, subscribers
//! are woken on every publish, and late subscribers only see the current and
//! future states.
//!
//! The [`CellMap`] owns cells weakly. Presenters hold the `Arc`; once the
//! last strong reference is dropped, the map entry is dead and the next
//! `get_or_create` installs a fresh cell seeded with `None`, a cache miss
//! indistinguishable from a first request. None of the map operations panic
//! or return errors; a reclaimed cell makes updates silent no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::state::{CacheState, Claim};

/// Observable holder of `Option<CacheState<T>>` for exactly one key.
pub struct StateCell<T> {
  tx: watch::Sender<Option<CacheState<T>>>,
}

impl<T: Clone> StateCell<T> {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(None);
    Self { tx }
  }

  /// Snapshot of the current state.
  pub fn get(&self) -> Option<CacheState<T>> {
    self.tx.borrow().clone()
  }

  /// Current loaded value, if any.
  pub fn value(&self) -> Option<T> {
    self.tx.borrow().as_ref().and_then(|s| s.value().cloned())
  }

  /// Subscribe to state changes. The receiver immediately sees the current
  /// state and is notified on every publish.
  pub fn subscribe(&self) -> watch::Receiver<Option<CacheState<T>>> {
    self.tx.subscribe()
  }

  /// Publish a new state, notifying all subscribers.
  pub fn publish(&self, state: CacheState<T>) {
    self.tx.send_replace(Some(state));
  }

  /// Atomically decide who runs the next fetch for this key.
  ///
  /// In a single read-modify-write on the channel:
  /// - a cell already `Refreshing` yields [`Claim::InFlight`] (join it);
  /// - a `Loaded` cell accepted by `reuse` yields [`Claim::Reused`];
  /// - anything else transitions to `Refreshing` and yields
  ///   [`Claim::Claimed`]: the caller now owns the fetch.
  pub fn begin_refresh(&self, mut reuse: impl FnMut(&T, DateTime<Utc>) -> bool) -> Claim<T> {
    let mut claim = Claim::Claimed;
    self.tx.send_if_modified(|current| match current {
      Some(CacheState::Refreshing) => {
        claim = Claim::InFlight;
        false
      }
      Some(CacheState::Loaded { value, cached_at }) if reuse(value, *cached_at) => {
        claim = Claim::Reused {
          value: value.clone(),
          cached_at: *cached_at,
        };
        false
      }
      other => {
        *other = Some(CacheState::Refreshing);
        true
      }
    });
    claim
  }

  /// Publish a loaded value unless a fetch is in flight.
  ///
  /// Used when a fresh value is read from the persistent store: an in-flight
  /// fetch must keep exclusive write access to the cell so per-key ordering
  /// holds.
  pub fn publish_loaded_unless_refreshing(&self, value: T, cached_at: DateTime<Utc>) {
    self.tx.send_if_modified(|current| {
      if matches!(current, Some(CacheState::Refreshing)) {
        false
      } else {
        *current = Some(CacheState::loaded(value.clone(), cached_at));
        true
      }
    });
  }

  /// Wait until the cell is no longer `Refreshing` and return that state.
  pub async fn settled(&self) -> CacheState<T> {
    let mut rx = self.subscribe();
    loop {
      if let Some(state) = rx.borrow_and_update().clone() {
        if !state.is_refreshing() {
          return state;
        }
      }
      // The sender lives in `self`, so `changed` cannot fail here.
      if rx.changed().await.is_err() {
        return CacheState::Refreshing;
      }
    }
  }
}

impl<T: Clone> Default for StateCell<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Concurrency-safe map from key to weakly-owned state cell.
pub struct CellMap<T> {
  cells: Mutex<HashMap<String, Weak<StateCell<T>>>>,
}

impl<T: Clone> CellMap<T> {
  pub fn new() -> Self {
    Self {
      cells: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Weak<StateCell<T>>>> {
    self.cells.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// The still-reachable cell for `key`, if any.
  pub fn get(&self, key: &str) -> Option<Arc<StateCell<T>>> {
    self.lock().get(key).and_then(Weak::upgrade)
  }

  /// Current loaded value for `key`, if its cell is reachable and loaded.
  pub fn get_value(&self, key: &str) -> Option<T> {
    self.get(key).and_then(|cell| cell.value())
  }

  /// Look up or install the cell for `key`.
  ///
  /// Returns the cell and whether it was newly created. Both the liveness
  /// check and the install happen inside the map's structural critical
  /// section: a caller that sees `created == false` knows someone else
  /// already owns the key's lifecycle and must join rather than duplicate
  /// work.
  pub fn get_or_create(&self, key: &str) -> (Arc<StateCell<T>>, bool) {
    let mut cells = self.lock();
    if let Some(cell) = cells.get(key).and_then(Weak::upgrade) {
      return (cell, false);
    }
    let cell = Arc::new(StateCell::new());
    cells.insert(key.to_string(), Arc::downgrade(&cell));
    (cell, true)
  }

  /// Batch form of [`get_or_create`]: one critical section for all keys.
  ///
  /// Returns every requested cell plus the subset of keys that were newly
  /// created, so the caller fetches only those.
  pub fn get_or_create_batch(
    &self,
    keys: &[String],
  ) -> (HashMap<String, Arc<StateCell<T>>>, Vec<String>) {
    let mut cells = self.lock();
    let mut out = HashMap::with_capacity(keys.len());
    let mut created = Vec::new();
    for key in keys {
      if out.contains_key(key) {
        continue;
      }
      let cell = match cells.get(key).and_then(Weak::upgrade) {
        Some(cell) => cell,
        None => {
          let cell = Arc::new(StateCell::new());
          cells.insert(key.clone(), Arc::downgrade(&cell));
          created.push(key.clone());
          cell
        }
      };
      out.insert(key.clone(), cell);
    }
    (out, created)
  }

  /// Publish `state` into the cell for `key`. No-op if the cell was
  /// reclaimed.
  pub fn update(&self, key: &str, state: CacheState<T>) {
    if let Some(cell) = self.get(key) {
      cell.publish(state);
    }
  }

  /// Publish the result of `f` applied to the current state. No-op if the
  /// cell was reclaimed.
  pub fn update_with(&self, key: &str, f: impl FnOnce(Option<CacheState<T>>) -> CacheState<T>) {
    if let Some(cell) = self.get(key) {
      let next = f(cell.get());
      cell.publish(next);
    }
  }

  /// Update every still-reachable cell with `f(key)`, pruning dead entries.
  ///
  /// Used for bulk invalidation, e.g. clearing every cached rating at once.
  pub fn compute_all(&self, mut f: impl FnMut(&str) -> CacheState<T>) {
    let mut cells = self.lock();
    cells.retain(|key, weak| match weak.upgrade() {
      Some(cell) => {
        cell.publish(f(key));
        true
      }
      None => false,
    });
  }

  /// Number of still-reachable cells.
  pub fn len(&self) -> usize {
    self.lock().values().filter(|w| w.strong_count() > 0).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T: Clone> Default for CellMap<T> {
  fn default() -> Self {
    Self::new()
  }
}
