//! Repositories: the fetch/cache/convert engines.
//!
//! `core` holds the generic engine; `library` specializes it with
//! saved-membership tracking; `playlist` replays local reorders onto the
//! remote service.

mod core;
mod library;
mod playlist;

pub use self::core::{FromRemote, Repository};
pub use self::library::{LibrarySnapshot, SavedLibrary};
pub use self::playlist::PlaylistSync;
