//! Offline-first synchronization core for a music streaming client.
//!
//! This crate reconciles a remote streaming API with a local persistent
//! cache and exposes the result to concurrent observers:
//! - [`Repository`]: generic fetch/cache/convert engine with TTL freshness,
//!   single-flight fetches and chunked parallel batching
//! - [`SavedLibrary`]: the user's saved-item set, with optimistic mutation
//!   and a broadcast event stream
//! - [`cache`]: weakly-owned observable state cells, reclaimed once nobody
//!   watches them
//! - [`reorder`]: planning remote move operations for a locally sorted list
//! - [`retry`]: swappable backoff policies for transient remote failures
//!
//! The remote fetcher and the persistent store are trait collaborators
//! ([`remote`], [`store`]); the crate contains no transport code and no
//! schema beyond its own cache table. Repositories are explicit instances
//! wired up at startup and shut down explicitly; there are no process-wide
//! singletons.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod remote;
pub mod reorder;
pub mod repo;
pub mod retry;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use event::LibraryEvent;
pub use repo::{FromRemote, LibrarySnapshot, PlaylistSync, Repository, SavedLibrary};
pub use retry::{BackoffPolicy, FixedBackoff};
