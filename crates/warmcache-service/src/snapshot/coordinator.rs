use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::config::{Config, LockWaitConfig};
use crate::engine::CacheEngine;

use super::{Publish, SnapshotError, SnapshotLock, SnapshotStore, StalenessThresholds, is_stale};

/// How a successful [`RefreshCoordinator::refresh`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The snapshot was not stale, possibly because another writer refreshed it meanwhile.
    Fresh,
    /// A new snapshot was generated and published.
    Published,
    /// The cache engine dumped nothing, the previous snapshot was kept.
    Empty,
    /// Another writer held the lock for the whole wait budget.
    ///
    /// This is not treated as a failure since the other writer is expected to finish the job,
    /// but there is no guarantee the snapshot actually was refreshed.
    LockTimeout,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Published => "published",
            Self::Empty => "empty",
            Self::LockTimeout => "lock-timeout",
        }
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string that is not one of the [`RefreshOutcome`] names.
#[derive(Debug, Error)]
#[error("unknown refresh outcome `{0}`")]
pub struct ParseOutcomeError(String);

impl FromStr for RefreshOutcome {
    type Err = ParseOutcomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "published" => Ok(Self::Published),
            "empty" => Ok(Self::Empty),
            "lock-timeout" => Ok(Self::LockTimeout),
            other => Err(ParseOutcomeError(other.to_owned())),
        }
    }
}

/// The working states of a refresh.
///
/// A refresh that returns `Ok` is done, one that returns a [`RefreshError`] has failed in the
/// state named by the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    CheckingStaleness,
    WaitingForLock,
    Regenerating,
    Publishing,
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckingStaleness => "checking staleness",
            Self::WaitingForLock => "waiting for the lock",
            Self::Regenerating => "regenerating",
            Self::Publishing => "publishing",
        })
    }
}

#[derive(Debug, Error)]
#[error("snapshot refresh failed while {state}")]
pub struct RefreshError {
    pub state: RefreshState,
    #[source]
    pub source: SnapshotError,
}

fn failed_in<E: Into<SnapshotError>>(state: RefreshState) -> impl FnOnce(E) -> RefreshError {
    move |err| RefreshError {
        state,
        source: err.into(),
    }
}

/// Regenerates a stale snapshot, making sure only one writer does so at a time.
#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    store: SnapshotStore,
    thresholds: StalenessThresholds,
    lock_wait: LockWaitConfig,
}

impl RefreshCoordinator {
    pub fn new(
        store: SnapshotStore,
        thresholds: StalenessThresholds,
        lock_wait: LockWaitConfig,
    ) -> Self {
        Self {
            store,
            thresholds,
            lock_wait,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SnapshotStore::new(&config.usercache_dump),
            config.thresholds(),
            config.lock_wait,
        )
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Dumps `engine` into a new snapshot if the current one is stale.
    ///
    /// The engine is dumped on the blocking thread pool. The lock marker is removed on every exit
    /// path, including failures.
    pub async fn refresh(
        &self,
        engine: Arc<dyn CacheEngine>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let result = self.run(engine).await;
        match result {
            Ok(outcome) => {
                tracing::info!(
                    "Refresh of snapshot `{}`: {}",
                    self.store.path().display(),
                    outcome
                );
                metric!(counter("snapshot.refresh") += 1, "outcome" => outcome.as_str());
            }
            Err(ref err) => {
                let dynerr: &dyn std::error::Error = err;
                tracing::error!(error = dynerr, "Failed to refresh snapshot");
                metric!(counter("snapshot.refresh") += 1, "outcome" => "failed");
            }
        }
        result
    }

    async fn run(&self, engine: Arc<dyn CacheEngine>) -> Result<RefreshOutcome, RefreshError> {
        // `None` if the budget is too large to be represented, we then wait without a deadline
        let deadline = Instant::now().checked_add(self.lock_wait.timeout);

        let lock = loop {
            if !self.is_stale().map_err(failed_in(RefreshState::CheckingStaleness))? {
                return Ok(RefreshOutcome::Fresh);
            }

            let acquired = self
                .store
                .try_acquire_lock()
                .map_err(failed_in(RefreshState::WaitingForLock))?;
            if let Some(lock) = acquired {
                break lock;
            }

            let released = self
                .wait_for_release(deadline)
                .await
                .map_err(failed_in(RefreshState::WaitingForLock))?;
            if !released {
                tracing::warn!(
                    "Gave up waiting for snapshot lock `{}` after {:?}",
                    self.store.lock_path().display(),
                    self.lock_wait.timeout
                );
                return Ok(RefreshOutcome::LockTimeout);
            }
        };

        self.regenerate(lock, engine).await
    }

    /// Regenerates the snapshot while holding `lock`, unless it became fresh in the meantime.
    async fn regenerate(
        &self,
        lock: SnapshotLock,
        engine: Arc<dyn CacheEngine>,
    ) -> Result<RefreshOutcome, RefreshError> {
        // Someone else may have refreshed the snapshot while we raced for the lock.
        if !self.is_stale().map_err(failed_in(RefreshState::CheckingStaleness))? {
            lock.release()
                .map_err(failed_in(RefreshState::CheckingStaleness))?;
            return Ok(RefreshOutcome::Fresh);
        }

        // The lock moves along so it stays held until the dump is done, even if we are dropped.
        let store = self.store.clone();
        let (published, released) = tokio::task::spawn_blocking(move || {
            let published = dump_and_publish(&store, &*engine);
            (published, lock.release())
        })
        .await
        .map_err(|err| failed_in(RefreshState::Regenerating)(io::Error::other(err)))?;
        let released = released.map_err(failed_in(RefreshState::Publishing));

        match published? {
            Publish::Published { size } => {
                metric!(gauge("snapshot.size") = size);
                released?;
                Ok(RefreshOutcome::Published)
            }
            Publish::Empty => {
                tracing::warn!("Cache engine dumped an empty snapshot, keeping the previous one");
                released?;
                Ok(RefreshOutcome::Empty)
            }
        }
    }

    fn is_stale(&self) -> io::Result<bool> {
        let metadata = self.store.metadata()?;
        Ok(is_stale(&metadata, &self.thresholds))
    }

    /// Polls the lock marker until it disappears, or `deadline` passes.
    ///
    /// Returns `true` if the lock was released in time.
    async fn wait_for_release(&self, deadline: Option<Instant>) -> io::Result<bool> {
        let wait_start = Instant::now();
        tracing::debug!(
            "Snapshot lock `{}` is taken, waiting",
            self.store.lock_path().display()
        );

        loop {
            let mut interval = self.lock_wait.interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    metric!(timer("snapshot.lock.wait") = wait_start.elapsed(), "released" => "false");
                    return Ok(false);
                }
                interval = interval.min(deadline - now);
            }
            tokio::time::sleep(interval).await;

            if !self.store.is_locked()? {
                metric!(timer("snapshot.lock.wait") = wait_start.elapsed(), "released" => "true");
                return Ok(true);
            }
        }
    }
}

/// Dumps the engine into a staging file and publishes it. This blocks on file I/O.
fn dump_and_publish(
    store: &SnapshotStore,
    engine: &dyn CacheEngine,
) -> Result<Publish, RefreshError> {
    let dump_start = Instant::now();
    let mut staging = store
        .staging_file()
        .map_err(failed_in(RefreshState::Regenerating))?;
    engine
        .dump(staging.as_file_mut())
        .map_err(failed_in(RefreshState::Regenerating))?;
    metric!(timer("snapshot.dump.duration") = dump_start.elapsed());

    store
        .publish(staging)
        .map_err(failed_in(RefreshState::Publishing))
}
