//! Replaying a local reorder onto a remote playlist.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::remote::ReorderClient;
use crate::reorder::{self, ReorderOp};
use crate::retry::{self, BackoffPolicy, FixedBackoff};

/// Pushes a locally computed ordering to the remote service, one move at a
/// time, then verifies against the order the remote actually ended up with.
///
/// The verify phase exists because the remote applies each move against its
/// own list state; trusting the local replay to match it exactly would let a
/// divergence go unnoticed. The remote order always wins.
pub struct PlaylistSync<C> {
  client: Arc<C>,
  backoff: Arc<dyn BackoffPolicy>,
}

impl<C: ReorderClient> PlaylistSync<C> {
  pub fn new(client: Arc<C>) -> Self {
    Self {
      client,
      backoff: Arc::new(FixedBackoff::default()),
    }
  }

  pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
    self.backoff = backoff;
    self
  }

  /// Sort `items` remotely with `cmp` and return the authoritative order.
  ///
  /// Plans the moves, replays them in sequence (each against the state the
  /// previous one produced), then re-fetches the remote's item order. `items`
  /// must be keyed by the same ids the remote reports.
  pub async fn push_order<T>(
    &self,
    container_id: &str,
    items: &[T],
    cmp: impl FnMut(&T, &T) -> Ordering,
    id_of: impl Fn(&T) -> &str,
  ) -> Result<Vec<String>> {
    let ops = reorder::plan(items, cmp);
    debug!(container_id, moves = ops.len(), "replaying reorder plan");

    for op in &ops {
      self.apply_remote(container_id, op).await?;
    }

    // Verify: the remote's interpretation of the moves is authoritative.
    let remote_order = retry::run(self.backoff.as_ref(), || {
      self.client.container_items(container_id)
    })
    .await?;

    let mut predicted: Vec<String> = items.iter().map(|t| id_of(t).to_string()).collect();
    reorder::apply_all(&mut predicted, &ops);
    if remote_order != predicted {
      warn!(
        container_id,
        "remote order diverges from local prediction after reorder"
      );
    }

    Ok(remote_order)
  }

  async fn apply_remote(&self, container_id: &str, op: &ReorderOp) -> Result<()> {
    retry::run(self.backoff.as_ref(), || {
      self
        .client
        .reorder_range(container_id, op.range_start, op.range_length, op.insert_before)
    })
    .await
  }
}
