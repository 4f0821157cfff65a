use std::time::Duration;

/// Filesystem facts about a snapshot at the time they were collected.
///
/// This is never cached, every staleness decision stats the snapshot anew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub exists: bool,
    /// Time since the last modification. Zero for missing snapshots and for mtimes in the future.
    pub age: Duration,
    pub size: u64,
}

impl SnapshotMetadata {
    /// Metadata of a snapshot that does not exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            age: Duration::ZERO,
            size: 0,
        }
    }
}

/// Limits beyond which a snapshot needs to be regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessThresholds {
    /// Snapshots at least this old are stale.
    pub max_age: Duration,
    /// Snapshots smaller than this are stale, `0` disables the check.
    pub min_size: u64,
}

/// Decides whether a snapshot with the given `metadata` has to be regenerated.
pub fn is_stale(metadata: &SnapshotMetadata, thresholds: &StalenessThresholds) -> bool {
    if !metadata.exists {
        return true;
    }
    if metadata.age >= thresholds.max_age {
        return true;
    }
    thresholds.min_size > 0 && metadata.size < thresholds.min_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(max_age_secs: u64, min_size: u64) -> StalenessThresholds {
        StalenessThresholds {
            max_age: Duration::from_secs(max_age_secs),
            min_size,
        }
    }

    fn snapshot(age_secs: u64, size: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            exists: true,
            age: Duration::from_secs(age_secs),
            size,
        }
    }

    #[test]
    fn test_missing_is_always_stale() {
        let missing = SnapshotMetadata::missing();
        assert!(is_stale(&missing, &thresholds(600, 0)));
        assert!(is_stale(&missing, &thresholds(u64::MAX, 0)));
        assert!(is_stale(&missing, &thresholds(0, u64::MAX)));
    }

    #[test]
    fn test_age() {
        let limits = thresholds(600, 0);
        assert!(!is_stale(&snapshot(0, 500), &limits));
        assert!(!is_stale(&snapshot(599, 500), &limits));
        assert!(is_stale(&snapshot(600, 500), &limits));
        assert!(is_stale(&snapshot(3600, 500), &limits));
    }

    #[test]
    fn test_min_size() {
        let limits = thresholds(600, 100);
        assert!(is_stale(&snapshot(1, 0), &limits));
        assert!(is_stale(&snapshot(1, 99), &limits));
        assert!(!is_stale(&snapshot(1, 100), &limits));
    }

    #[test]
    fn test_min_size_disabled() {
        // an existing but empty snapshot is fine when the size check is off
        assert!(!is_stale(&snapshot(1, 0), &thresholds(600, 0)));
    }
}
