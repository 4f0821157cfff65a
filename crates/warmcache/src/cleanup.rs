//! Removes leftovers of snapshot writers that died mid-refresh.

use std::fs;
use std::io;

use anyhow::{Context, Result};
use warmcache_service::config::Config;
use warmcache_service::snapshot::SnapshotStore;

/// What a cleanup run did, or would have done with `dry_run`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub staging_files: usize,
    pub released_lock: bool,
}

/// Removes orphaned staging files next to the configured snapshot.
///
/// While a lock marker exists a writer may still be working on its staging file, so nothing is
/// removed unless `release_lock` is set, which also removes the marker.
pub fn cleanup(config: &Config, dry_run: bool, release_lock: bool) -> Result<CleanupReport> {
    let store = SnapshotStore::new(&config.usercache_dump);
    let mut report = CleanupReport::default();

    if store.is_locked().context("failed to check the snapshot lock")? {
        if !release_lock {
            tracing::warn!(
                "Snapshot `{}` is locked, skipping cleanup. Use --release-lock if no writer is running",
                store.path().display()
            );
            return Ok(report);
        }

        if dry_run {
            tracing::info!("Would release lock `{}`", store.lock_path().display());
        } else {
            store
                .release_lock()
                .context("failed to release the snapshot lock")?;
            tracing::info!("Released lock `{}`", store.lock_path().display());
        }
        report.released_lock = true;
    }

    let orphans = store
        .orphaned_staging_files()
        .context("failed to list staging files")?;
    for path in orphans {
        if dry_run {
            tracing::info!("Would remove `{}`", path.display());
        } else {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed `{}`", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove `{}`", path.display()));
                }
            }
        }
        report.staging_files += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn setup(dir: &Path) -> Config {
        std::fs::write(dir.join("usercache.dump"), b"{}").unwrap();
        std::fs::write(dir.join("usercache.dump.a1B2c3D4"), b"half").unwrap();
        std::fs::write(dir.join("usercache.dump.x9y8z7w6"), b"").unwrap();
        std::fs::write(dir.join("unrelated.txt"), b"keep").unwrap();

        Config {
            usercache_dump: dir.join("usercache.dump"),
            ..Default::default()
        }
    }

    #[test]
    fn test_cleanup() {
        warmcache_test::setup();
        let dir = warmcache_test::tempdir();
        let config = setup(dir.path());

        let report = cleanup(&config, false, false).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                staging_files: 2,
                released_lock: false
            }
        );
        assert!(!dir.path().join("usercache.dump.a1B2c3D4").exists());
        assert!(dir.path().join("usercache.dump").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_cleanup_dry_run() {
        warmcache_test::setup();
        let dir = warmcache_test::tempdir();
        let config = setup(dir.path());

        let report = cleanup(&config, true, false).unwrap();
        assert_eq!(report.staging_files, 2);
        assert!(dir.path().join("usercache.dump.a1B2c3D4").exists());
    }

    #[test]
    fn test_cleanup_respects_lock() {
        warmcache_test::setup();
        let dir = warmcache_test::tempdir();
        let config = setup(dir.path());
        std::fs::write(dir.path().join("usercache.dump.lock"), b"").unwrap();

        let report = cleanup(&config, false, false).unwrap();
        assert_eq!(report, CleanupReport::default());
        assert!(dir.path().join("usercache.dump.a1B2c3D4").exists());

        let report = cleanup(&config, false, true).unwrap();
        assert!(report.released_lock);
        assert_eq!(report.staging_files, 2);
        assert!(!dir.path().join("usercache.dump.lock").exists());
    }
}
