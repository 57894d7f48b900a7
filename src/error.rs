//! Error taxonomy for the sync engine.
//!
//! Failures are classified so the retry loop and batch operations can tell
//! "try again later" apart from "this entity is gone" and "the local store is
//! broken". Payloads are plain strings so errors stay `Clone` when a single
//! in-flight fetch fans its outcome out to several joined callers.

use thiserror::Error;

/// Errors produced by repositories, stores and remote clients.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// Transient remote failure (timeout, connection reset, 5xx). Retryable.
  #[error("transport error: {0}")]
  Transport(String),

  /// The remote reports the entity no longer exists. Terminal for this id.
  #[error("{id} not found on remote")]
  NotFound { id: String },

  /// The remote payload for one id could not be converted. Terminal for
  /// this id; other ids in the same batch are unaffected.
  #[error("malformed payload for {id}: {reason}")]
  Malformed { id: String, reason: String },

  /// Local persistence failure. Always propagated: silently losing a write
  /// would desynchronize the cache from its own backing store.
  #[error("storage error: {0}")]
  Storage(String),

  /// Configuration could not be loaded or validated.
  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  pub fn not_found(id: impl Into<String>) -> Self {
    Error::NotFound { id: id.into() }
  }

  pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
    Error::Malformed {
      id: id.into(),
      reason: reason.into(),
    }
  }

  /// Whether the backoff policy should be consulted for another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::Transport(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
