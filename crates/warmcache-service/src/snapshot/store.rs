use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::engine::CacheEngine;

use super::{SnapshotError, SnapshotMetadata};

/// Suffix appended to the snapshot path to form the lock marker path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Number of random characters in a staging file name.
const STAGING_SUFFIX_LEN: usize = 8;

/// The result of [`SnapshotStore::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The staging file of the given size replaced the snapshot.
    Published { size: u64 },
    /// The staging file was empty and has been discarded.
    Empty,
}

/// All filesystem access to a snapshot and its lock marker.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(LOCK_SUFFIX);

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    /// The canonical snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn file_name(&self) -> io::Result<&std::ffi::OsStr> {
        self.path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{}` is not a snapshot file path", self.path.display()),
            )
        })
    }

    /// Stats the snapshot. A missing snapshot is not an error.
    pub fn metadata(&self) -> io::Result<SnapshotMetadata> {
        let metadata = match catch_not_found(|| self.path.metadata())? {
            Some(metadata) => metadata,
            None => return Ok(SnapshotMetadata::missing()),
        };
        tracing::trace!("Snapshot `{}` length: {}", self.path.display(), metadata.len());

        Ok(SnapshotMetadata {
            exists: true,
            age: metadata.modified()?.elapsed().unwrap_or_default(),
            size: metadata.len(),
        })
    }

    /// Attempts to create the lock marker.
    ///
    /// Returns `None` if the marker already exists. Creation is exclusive, so of any number of
    /// concurrent callers on the same filesystem at most one gets the lock.
    pub fn try_acquire_lock(&self) -> io::Result<Option<SnapshotLock>> {
        fs::create_dir_all(self.directory())?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(_) => {
                tracing::debug!("Acquired snapshot lock `{}`", self.lock_path.display());
                Ok(Some(SnapshotLock {
                    store: self.clone(),
                    released: false,
                }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether the lock marker currently exists.
    pub fn is_locked(&self) -> io::Result<bool> {
        Ok(catch_not_found(|| self.lock_path.symlink_metadata())?.is_some())
    }

    /// Removes the lock marker. Removing a marker that does not exist is not an error.
    pub fn release_lock(&self) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(&self.lock_path))?;
        Ok(())
    }

    /// Creates a uniquely named staging file next to the snapshot.
    ///
    /// The file is deleted when dropped without having been published.
    pub fn staging_file(&self) -> io::Result<NamedTempFile> {
        let mut prefix = self.file_name()?.to_owned();
        prefix.push(".");

        let directory = self.directory();
        fs::create_dir_all(directory)?;
        tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(STAGING_SUFFIX_LEN)
            .tempfile_in(directory)
    }

    /// Atomically replaces the snapshot with the contents of `staging`.
    ///
    /// Empty staging files are discarded and leave the current snapshot untouched.
    pub fn publish(&self, staging: NamedTempFile) -> Result<Publish, SnapshotError> {
        let size = staging.as_file().metadata()?.len();
        if size == 0 {
            tracing::debug!("Discarding empty staging file `{}`", staging.path().display());
            staging.close()?;
            return Ok(Publish::Empty);
        }

        staging.as_file().sync_all()?;
        match staging.persist(&self.path) {
            Ok(_) => {
                tracing::debug!("Published snapshot `{}` ({} bytes)", self.path.display(), size);
                Ok(Publish::Published { size })
            }
            // the staging file is removed when the returned handle is dropped
            Err(err) if err.error.kind() == io::ErrorKind::CrossesDevices => {
                Err(SnapshotError::CrossDevice)
            }
            Err(err) => Err(err.error.into()),
        }
    }

    /// Loads the snapshot into `engine`, returning the number of loaded entries.
    ///
    /// A missing snapshot is reported as [`SnapshotError::NotFound`], separately from engine
    /// failures.
    pub fn load(&self, engine: &dyn CacheEngine) -> Result<usize, SnapshotError> {
        let bytes = match catch_not_found(|| fs::read(&self.path))? {
            Some(bytes) => bytes,
            None => return Err(SnapshotError::NotFound),
        };

        Ok(engine.load(&bytes)?)
    }

    /// Lists staging files left behind by writers that died before publishing.
    ///
    /// This is only safe to act upon while no writer holds the lock.
    pub fn orphaned_staging_files(&self) -> io::Result<Vec<PathBuf>> {
        let file_name = self.file_name()?.to_string_lossy().into_owned();
        let prefix = format!("{file_name}.");

        let entries = match catch_not_found(|| fs::read_dir(self.directory()))? {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(suffix) = name.to_str().and_then(|name| name.strip_prefix(&prefix)) else {
                continue;
            };
            let is_staging = suffix.len() == STAGING_SUFFIX_LEN
                && suffix.bytes().all(|b| b.is_ascii_alphanumeric());
            if is_staging && entry.file_type()?.is_file() {
                orphans.push(entry.path());
            }
        }
        orphans.sort();

        Ok(orphans)
    }
}

/// Holds the lock marker of a snapshot and removes it when dropped.
#[derive(Debug)]
pub struct SnapshotLock {
    store: SnapshotStore,
    released: bool,
}

impl SnapshotLock {
    /// Removes the lock marker, reporting failures to the caller.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.store.release_lock()
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.store.release_lock() {
            let path = self.store.lock_path().display().to_string();
            sentry::with_scope(
                |scope| scope.set_extra("path", path.into()),
                || tracing::error!("Failed to release snapshot lock: {:?}", err),
            );
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
