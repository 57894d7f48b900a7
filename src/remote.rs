//! Remote fetcher collaborators.
//!
//! The sync engine never talks to the wire itself; it drives these traits
//! and leaves transport, authentication and payload parsing to the client
//! implementation. Clients surface failures as [`Error`](crate::Error)
//! values, classified so the retry loop can tell a timeout from a 404.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Per-entity fetch endpoints of the streaming service.
#[async_trait]
pub trait SourceClient: Send + Sync {
  /// Remote representation, converted to the local one at the repository's
  /// conversion seam.
  type Remote: Send;

  /// Maximum number of ids one batch endpoint call accepts.
  fn batch_limit(&self) -> usize {
    50
  }

  /// Fetch one entity. `Error::NotFound` when the remote no longer has it.
  async fn fetch_one(&self, id: &str) -> Result<Self::Remote>;

  /// Fetch one chunk of at most [`batch_limit`](Self::batch_limit) ids.
  /// Missing ids come back as `None`, in input order.
  async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Self::Remote>>>;
}

/// Library-membership endpoints ("saved" items and ratings).
#[async_trait]
pub trait LibraryClient: SourceClient {
  /// Maximum number of ids one saved-check or saved-push call accepts.
  fn saved_batch_limit(&self) -> usize {
    self.batch_limit()
  }

  /// The user's full saved library. Pagination is the client's concern; the
  /// result is the fully accumulated list.
  async fn fetch_library(&self) -> Result<Vec<Self::Remote>>;

  /// Whether each id is in the user's library, in input order. One chunk.
  async fn check_saved(&self, ids: &[String]) -> Result<Vec<bool>>;

  /// Add (`saved = true`) or remove ids from the user's library. One chunk.
  async fn push_saved(&self, ids: &[String], saved: bool) -> Result<()>;

  /// Set or clear (`None`) the user's rating for one entity.
  async fn push_rating(&self, id: &str, rating: Option<u8>) -> Result<()>;
}

/// Ordered-container endpoints used by playlist synchronization.
#[async_trait]
pub trait ReorderClient: Send + Sync {
  /// Move the `range_length` items starting at `range_start` so they end up
  /// before the item currently at `insert_before`.
  async fn reorder_range(
    &self,
    container_id: &str,
    range_start: usize,
    range_length: usize,
    insert_before: usize,
  ) -> Result<()>;

  /// Authoritative item order of a container, used by the verify phase.
  async fn container_items(&self, container_id: &str) -> Result<Vec<String>>;
}

// One client instance is typically shared between several repositories, so
// the traits pass through `Arc`.

#[async_trait]
impl<C: SourceClient + ?Sized> SourceClient for Arc<C> {
  type Remote = C::Remote;

  fn batch_limit(&self) -> usize {
    (**self).batch_limit()
  }

  async fn fetch_one(&self, id: &str) -> Result<Self::Remote> {
    (**self).fetch_one(id).await
  }

  async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Self::Remote>>> {
    (**self).fetch_many(ids).await
  }
}

#[async_trait]
impl<C: LibraryClient + ?Sized> LibraryClient for Arc<C> {
  fn saved_batch_limit(&self) -> usize {
    (**self).saved_batch_limit()
  }

  async fn fetch_library(&self) -> Result<Vec<Self::Remote>> {
    (**self).fetch_library().await
  }

  async fn check_saved(&self, ids: &[String]) -> Result<Vec<bool>> {
    (**self).check_saved(ids).await
  }

  async fn push_saved(&self, ids: &[String], saved: bool) -> Result<()> {
    (**self).push_saved(ids, saved).await
  }

  async fn push_rating(&self, id: &str, rating: Option<u8>) -> Result<()> {
    (**self).push_rating(id, rating).await
  }
}

#[async_trait]
impl<C: ReorderClient + ?Sized> ReorderClient for Arc<C> {
  async fn reorder_range(
    &self,
    container_id: &str,
    range_start: usize,
    range_length: usize,
    insert_before: usize,
  ) -> Result<()> {
    (**self)
      .reorder_range(container_id, range_start, range_length, insert_before)
      .await
  }

  async fn container_items(&self, container_id: &str) -> Result<Vec<String>> {
    (**self).container_items(container_id).await
  }
}
