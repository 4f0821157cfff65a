use async_trait::async_trait;
use thiserror::Error;

use crate::engine::{CacheEngine, EngineError};
use crate::trigger::{TriggerCommand, TriggerError};

use super::{RefreshOutcome, SnapshotError, SnapshotStore, StalenessThresholds, is_stale};

/// Something that can ask a refresher to regenerate the snapshot.
#[async_trait]
pub trait RefreshTrigger: Send + Sync {
    async fn request_refresh(&self, command: TriggerCommand)
    -> Result<RefreshOutcome, TriggerError>;
}

/// Why a worker could not load the snapshot on startup.
#[derive(Debug, Error)]
pub enum LoadError {
    /// There is no snapshot, the worker has to decide whether to start with an empty cache.
    #[error("no snapshot to load at `{0}`")]
    NotFound(String),
    /// The snapshot exists but the cache engine could not load it.
    #[error("failed to load the snapshot into the cache engine")]
    Engine(#[source] EngineError),
    #[error("failed to read the snapshot")]
    Io(#[source] std::io::Error),
}

/// Makes sure the snapshot is reasonably fresh and loads it into `engine`.
///
/// A stale snapshot triggers a refresh through `trigger`. Freshness is best-effort: when the
/// trigger fails, whatever snapshot exists is loaded anyway. Returns the number of loaded entries.
pub async fn ensure_fresh_and_load(
    store: &SnapshotStore,
    thresholds: &StalenessThresholds,
    trigger: &dyn RefreshTrigger,
    engine: &dyn CacheEngine,
) -> Result<usize, LoadError> {
    let stale = match store.metadata() {
        Ok(metadata) => is_stale(&metadata, thresholds),
        Err(err) => {
            tracing::warn!("Failed to stat snapshot `{}`: {}", store.path().display(), err);
            true
        }
    };

    if stale {
        match trigger.request_refresh(TriggerCommand::SaveUserCache).await {
            Ok(outcome) => tracing::debug!("Requested snapshot refresh: {}", outcome),
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, "Snapshot refresh failed, loading stale snapshot");
            }
        }
    }

    let result = store.load(engine);
    let tag = match result {
        Ok(_) => "ok",
        Err(SnapshotError::NotFound) => "not_found",
        Err(_) => "error",
    };
    metric!(counter("snapshot.load") += 1, "result" => tag);

    match result {
        Ok(count) => {
            tracing::info!("Loaded {} entries from `{}`", count, store.path().display());
            Ok(count)
        }
        Err(SnapshotError::NotFound) => {
            Err(LoadError::NotFound(store.path().display().to_string()))
        }
        Err(SnapshotError::Engine(err)) => Err(LoadError::Engine(err)),
        Err(SnapshotError::Io(err)) => Err(LoadError::Io(err)),
        Err(SnapshotError::CrossDevice) => Err(LoadError::Io(std::io::Error::other(
            "snapshot crosses filesystems",
        ))),
    }
}
