//! Library change events.
//!
//! Membership changes fan out to every presenter that keeps a list on
//! screen, so they can patch incrementally instead of reloading. The stream
//! is a broadcast channel: all live subscribers see every event, late
//! subscribers only see future events, and a subscriber that falls behind
//! loses the oldest events rather than stalling the producers.

use tokio::sync::broadcast;

/// Events emitted by the saved-library repository.
#[derive(Debug, Clone)]
pub enum LibraryEvent {
  /// Membership changed for these ids (confirmed by the remote).
  SetSaved { ids: Vec<String>, saved: bool },
  /// A remote library fetch completed; `total` is the library size.
  LibraryRefreshed { total: usize },
  /// All locally cached ratings were cleared.
  RatingsCleared,
}

/// Multi-subscriber event stream.
pub struct LibraryEvents {
  tx: broadcast::Sender<LibraryEvent>,
}

impl LibraryEvents {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
    self.tx.subscribe()
  }

  /// Emit to all current subscribers. Emitting with no subscribers is fine.
  pub fn emit(&self, event: LibraryEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for LibraryEvents {
  fn default() -> Self {
    Self::new(64)
  }
}
