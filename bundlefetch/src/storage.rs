//! Storage advisor.
//!
//! Decides whether there is room for new content before any bytes are
//! committed. Capacity is read from the filesystem that holds the work
//! directory; a configurable safety margin is always kept free.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};

/// Snapshot of storage capacity. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StorageInfo {
    /// Total bytes on the filesystem.
    pub total: u64,
    /// Bytes available to unprivileged writers.
    pub available: u64,
    /// Bytes held under the orchestrator's work directory.
    pub used_by_app: u64,
}

/// Admission decision for new content.
///
/// Implementations fail closed: if capacity cannot be determined the request
/// is rejected with [`DownloadError::StorageUnavailable`].
pub trait StorageAdvisor: Send + Sync {
    /// Accept `required` bytes iff `available >= required + safety margin`.
    ///
    /// # Errors
    ///
    /// `InsufficientStorage { required, available }` when the margin would be
    /// violated, `StorageUnavailable` when statistics cannot be read.
    fn check(&self, required: u64) -> DownloadResult<StorageInfo>;

    /// Current capacity snapshot.
    fn info(&self) -> DownloadResult<StorageInfo>;
}

/// Apply the admission rule to a capacity snapshot.
pub fn admit(required: u64, info: StorageInfo, safety_margin: u64) -> DownloadResult<StorageInfo> {
    let fits = required
        .checked_add(safety_margin)
        .is_some_and(|need| info.available >= need);
    if fits {
        Ok(info)
    } else {
        Err(DownloadError::InsufficientStorage {
            required,
            available: info.available,
        })
    }
}

/// [`StorageAdvisor`] backed by filesystem statistics (`fs2`).
#[derive(Debug, Clone)]
pub struct FsStorageAdvisor {
    root: PathBuf,
    safety_margin: u64,
}

impl FsStorageAdvisor {
    /// Create an advisor for the filesystem holding `root`.
    pub fn new(root: impl Into<PathBuf>, safety_margin: u64) -> Self {
        Self {
            root: root.into(),
            safety_margin,
        }
    }

    /// The configured safety margin in bytes.
    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    /// Nearest existing ancestor of the root; statistics need a real path.
    fn probe_path(&self) -> &Path {
        let mut path = self.root.as_path();
        while !path.exists() {
            match path.parent() {
                Some(parent) => path = parent,
                None => break,
            }
        }
        path
    }
}

impl StorageAdvisor for FsStorageAdvisor {
    fn check(&self, required: u64) -> DownloadResult<StorageInfo> {
        let info = self.info()?;
        let decision = admit(required, info, self.safety_margin);
        match &decision {
            Ok(_) => debug!(
                required,
                available = info.available,
                margin = self.safety_margin,
                "Storage check passed"
            ),
            Err(_) => warn!(
                required,
                available = info.available,
                margin = self.safety_margin,
                "Storage check rejected request"
            ),
        }
        decision
    }

    fn info(&self) -> DownloadResult<StorageInfo> {
        let path = self.probe_path();
        let unavailable = |source| DownloadError::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        };

        let available = fs2::available_space(path).map_err(unavailable)?;
        let total = fs2::total_space(path).map_err(unavailable)?;

        Ok(StorageInfo {
            total,
            available,
            used_by_app: directory_size(&self.root),
        })
    }
}

/// Total size of regular files under `dir`. Unreadable entries count as zero.
pub fn directory_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => directory_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn snapshot(available: u64) -> StorageInfo {
        StorageInfo {
            total: 64 * GB,
            available,
            used_by_app: 0,
        }
    }

    #[test]
    fn test_admit_rejects_when_margin_violated() {
        let err = admit(5 * GB, snapshot(GB), 500 * MB).unwrap_err();
        match err {
            DownloadError::InsufficientStorage {
                required,
                available,
            } => {
                assert_eq!(required, 5 * GB);
                assert_eq!(available, GB);
            }
            other => panic!("Expected InsufficientStorage, got {:?}", other),
        }
    }

    #[test]
    fn test_admit_boundary_is_inclusive() {
        assert!(admit(GB, snapshot(GB + 500 * MB), 500 * MB).is_ok());
        assert!(admit(GB, snapshot(GB + 500 * MB - 1), 500 * MB).is_err());
    }

    #[test]
    fn test_admit_does_not_overflow() {
        assert!(admit(u64::MAX, snapshot(u64::MAX), 1).is_err());
    }

    #[test]
    fn test_fs_advisor_reports_capacity() {
        let temp = TempDir::new().unwrap();
        let advisor = FsStorageAdvisor::new(temp.path(), 0);

        let info = advisor.info().unwrap();
        assert!(info.total > 0);
        assert!(info.total >= info.available);
        assert_eq!(info.used_by_app, 0);
    }

    #[test]
    fn test_fs_advisor_counts_app_bytes() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("tasks").join("t1").join("chunks");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("0.part"), vec![0u8; 1000]).unwrap();
        fs::write(temp.path().join("top.bin"), vec![0u8; 24]).unwrap();

        let advisor = FsStorageAdvisor::new(temp.path(), 0);
        assert_eq!(advisor.info().unwrap().used_by_app, 1024);
    }

    #[test]
    fn test_fs_advisor_handles_missing_root() {
        let temp = TempDir::new().unwrap();
        let advisor = FsStorageAdvisor::new(temp.path().join("not").join("yet"), 0);

        let info = advisor.info().unwrap();
        assert!(info.total > 0);
        assert_eq!(info.used_by_app, 0);
    }

    #[test]
    fn test_fs_advisor_rejects_impossible_request() {
        let temp = TempDir::new().unwrap();
        let advisor = FsStorageAdvisor::new(temp.path(), 500 * MB);

        let result = advisor.check(u64::MAX / 2);
        assert!(matches!(
            result,
            Err(DownloadError::InsufficientStorage { .. })
        ));
    }
}
