//! Per-key cache state model.

use chrono::{DateTime, Utc};

use crate::error::Error;

/// The state of one cached entity, as observed through its cell.
///
/// The cell content is `Option<CacheState<T>>`; `None` means the key has
/// never been requested (or its cell was reclaimed and recreated), which is
/// distinct from any of these variants.
#[derive(Debug, Clone)]
pub enum CacheState<T> {
  /// A fetch is in flight. Any previous value is not exposed as final.
  Refreshing,
  /// A value from the store or a completed fetch, with the instant it was
  /// considered authoritative.
  Loaded { value: T, cached_at: DateTime<Utc> },
  /// The most recent fetch failed terminally (retries exhausted, not found,
  /// or malformed payload). The next request may try again.
  Failed { error: Error },
}

impl<T> CacheState<T> {
  pub fn loaded(value: T, cached_at: DateTime<Utc>) -> Self {
    CacheState::Loaded { value, cached_at }
  }

  pub fn is_refreshing(&self) -> bool {
    matches!(self, CacheState::Refreshing)
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, CacheState::Failed { .. })
  }

  /// The value, if loaded.
  pub fn value(&self) -> Option<&T> {
    match self {
      CacheState::Loaded { value, .. } => Some(value),
      _ => None,
    }
  }
}

/// Outcome of atomically trying to start a refresh on a cell.
#[derive(Debug)]
pub enum Claim<T> {
  /// The caller transitioned the cell to `Refreshing` and owns the fetch.
  Claimed,
  /// Another fetch is already in flight; the caller should await the cell.
  InFlight,
  /// The cell already holds a value the caller's reuse predicate accepted.
  Reused { value: T, cached_at: DateTime<Utc> },
}
