//! Reactive cache state shared between repositories and presenters.
//!
//! This module provides the in-memory half of the cache:
//! - Per-key state cells that presenters observe without blocking
//! - A weakly-owning map so entries vanish once nobody watches them
//! - The single-flight claim that keeps concurrent requests for one key
//!   down to one fetch

mod cells;
mod state;

pub use cells::{CellMap, StateCell};
pub use state::{CacheState, Claim};
