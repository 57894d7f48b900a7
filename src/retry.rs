//! Retry scheduling for remote calls.
//!
//! The policy is a swappable strategy so tests can run with zero delays or
//! no retries at all. Only failures classified as retryable by
//! [`Error::is_retryable`] consult the policy; not-found and malformed
//! payloads fail immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Maps an attempt number to the delay before the next attempt.
///
/// `attempt = 0` is the delay after the first failure. `None` means stop
/// retrying and surface the error.
pub trait BackoffPolicy: Send + Sync {
  fn delay_for(&self, attempt: u32) -> Option<Duration>;
}

/// Backoff over a fixed, ordered list of delays.
///
/// The default schedule is short at first (a blip on the network) and backs
/// off to a few seconds before giving up.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
  delays: Vec<Duration>,
}

impl FixedBackoff {
  pub fn new(delays: Vec<Duration>) -> Self {
    Self { delays }
  }

  pub fn from_millis(millis: &[u64]) -> Self {
    Self::new(millis.iter().copied().map(Duration::from_millis).collect())
  }

  /// A policy that never retries. Useful in tests.
  pub fn none() -> Self {
    Self::new(Vec::new())
  }
}

impl Default for FixedBackoff {
  fn default() -> Self {
    Self::from_millis(&[250, 500, 500, 2000, 5000])
  }
}

impl BackoffPolicy for FixedBackoff {
  fn delay_for(&self, attempt: u32) -> Option<Duration> {
    self.delays.get(attempt as usize).copied()
  }
}

/// Run `op` until it succeeds, fails terminally, or the policy is exhausted.
///
/// The error surfaced is always the one from the last attempt.
pub async fn run<T, F, Fut>(policy: &dyn BackoffPolicy, mut op: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt = 0u32;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_retryable() => match policy.delay_for(attempt) {
        Some(delay) => {
          tracing::debug!(attempt, ?delay, error = %err, "retrying after transient failure");
          if !delay.is_zero() {
            tokio::time::sleep(delay).await;
          }
          attempt += 1;
        }
        None => return Err(err),
      },
      Err(err) => return Err(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[test]
  fn test_fixed_schedule_indexes_then_stops() {
    let policy = FixedBackoff::from_millis(&[250, 500]);
    assert_eq!(policy.delay_for(0), Some(Duration::from_millis(250)));
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
    assert_eq!(policy.delay_for(2), None);
  }

  #[tokio::test]
  async fn test_exhaustion_after_schedule() {
    // Two delays => initial attempt plus two retries, three calls total.
    let policy = FixedBackoff::from_millis(&[10, 10]);
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result: Result<()> = run(&policy, move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Transport("down".into()))
      }
    })
    .await;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_terminal_error_skips_retry() {
    let policy = FixedBackoff::from_millis(&[0, 0, 0]);
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result: Result<()> = run(&policy, move || {
      let calls = calls_clone.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::not_found("track:1"))
      }
    })
    .await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_success_after_transient_failures() {
    let policy = FixedBackoff::from_millis(&[0, 0, 0]);
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let result = run(&policy, move || {
      let calls = calls_clone.clone();
      async move {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(Error::Transport("flaky".into()))
        } else {
          Ok(42)
        }
      }
    })
    .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
