//! # Snapshot coordination
//!
//! A snapshot is the serialized content of a [`CacheEngine`](crate::engine::CacheEngine) stored
//! in a single file. Many worker processes read it on startup, a single refresher writes it.
//!
//! ## Staleness
//!
//! Whether a snapshot needs to be regenerated is decided by [`is_stale`], purely based on the
//! snapshot's [`SnapshotMetadata`] and the configured [`StalenessThresholds`]. The metadata is
//! collected from the file system on every decision, so all processes agree on the same truth.
//!
//! ## Locking
//!
//! Regeneration is serialized through a zero-length lock marker next to the snapshot
//! (`<snapshot>.lock`). The marker is created with create-exclusive semantics, so of any number
//! of concurrent writers exactly one succeeds. Its existence is the entire lock state. Writers
//! that find the marker taken poll for its removal with a fixed interval and a fixed total budget,
//! see [`RefreshCoordinator`].
//!
//! A writer that holds the lock re-validates staleness before doing any work, so a herd of
//! writers racing for the lock only regenerates the snapshot once.
//!
//! ## Publishing
//!
//! New snapshots are written to a staging file in the snapshot's own directory and then renamed
//! over the canonical path. Readers thus only ever see either the previous or the new complete
//! snapshot. Empty dumps are never published, the previous snapshot is kept instead.
//!
//! ## Metrics
//!
//! - `snapshot.refresh`: Refresh attempts, tagged with their `outcome`.
//! - `snapshot.lock.wait`: Time spent waiting for another writer to release the lock.
//! - `snapshot.dump.duration`: Time spent dumping the cache engine.
//! - `snapshot.size`: Size of the last published snapshot.
//! - `snapshot.load`: Snapshot loads, tagged with their `result`.

use std::io;

use thiserror::Error;

use crate::engine::EngineError;

mod coordinator;
mod loader;
mod staleness;
mod store;

pub use coordinator::{RefreshCoordinator, RefreshError, RefreshOutcome, RefreshState};
pub use loader::{LoadError, RefreshTrigger, ensure_fresh_and_load};
pub use staleness::{SnapshotMetadata, StalenessThresholds, is_stale};
pub use store::{LOCK_SUFFIX, Publish, SnapshotLock, SnapshotStore};

/// An error accessing or producing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// There is no snapshot file.
    #[error("snapshot not found")]
    NotFound,
    /// The cache engine failed to dump or load the snapshot.
    #[error("cache engine failed")]
    Engine(#[from] EngineError),
    /// The staging file could not be renamed into place because it lives on another filesystem.
    #[error("staging file is on a different filesystem than the snapshot")]
    CrossDevice,
    /// Any other filesystem error.
    #[error("snapshot I/O failed")]
    Io(#[from] io::Error),
}
