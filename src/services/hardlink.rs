//! Hardlink materializer
//!
//! Idempotent single-file and recursive-directory hardlink creation. The
//! recursive form is deliberately lenient: an individual entry that fails to
//! link is logged and skipped, the rest of the tree is still mirrored.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum HardlinkError {
    #[error("source does not exist: {0}")]
    MissingSource(String),

    #[error("permission denied linking {source_path} -> {target}")]
    PermissionDenied { source_path: String, target: String },

    /// Hardlinks require source and target on the same filesystem
    #[error("cross-device link not permitted: {source_path} -> {target}")]
    CrossDevice { source_path: String, target: String },

    /// Someone created the target between our existence check and the link call
    #[error("target appeared concurrently: {0}")]
    ConcurrentCreation(String),

    #[error("io error linking {source_path} -> {target}: {err}")]
    Io {
        source_path: String,
        target: String,
        err: io::Error,
    },
}

impl HardlinkError {
    /// Cross-device and permission failures will not heal on retry
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, Self::CrossDevice { .. } | Self::PermissionDenied { .. })
    }
}

/// Result of a single link attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// Target already existed; treated as success (idempotent re-run)
    AlreadyExists,
}

/// Summary of a recursive directory mirror
#[derive(Debug, Default, Clone)]
pub struct MirrorSummary {
    pub linked: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct HardlinkService;

impl HardlinkService {
    pub fn new() -> Self {
        Self
    }

    /// Create a hardlink at `target` pointing at `source`.
    ///
    /// Ensures the target's parent directory exists. A target that already
    /// exists is a no-op, not an error.
    pub fn create_hardlink(&self, source: &Path, target: &Path) -> Result<LinkOutcome, HardlinkError> {
        if !source.exists() {
            return Err(HardlinkError::MissingSource(source.display().to_string()));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| map_io(source, target, err))?;
        }

        if target.exists() {
            debug!(target = %target.display(), "Hardlink target already exists, skipping");
            return Ok(LinkOutcome::AlreadyExists);
        }

        match std::fs::hard_link(source, target) {
            Ok(()) => {
                debug!(
                    source = %source.display(),
                    target = %target.display(),
                    "Hardlink created"
                );
                Ok(LinkOutcome::Created)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(
                HardlinkError::ConcurrentCreation(target.display().to_string()),
            ),
            Err(err) => Err(map_io(source, target, err)),
        }
    }

    /// Mirror a full directory subtree from `source_dir` into `target_dir`.
    ///
    /// Directories are created, files are hardlinked. Per-entry failures are
    /// logged and skipped rather than aborting the whole tree.
    pub fn create_hardlink_recursively(
        &self,
        source_dir: &Path,
        target_dir: &Path,
    ) -> Result<MirrorSummary, HardlinkError> {
        if !source_dir.exists() {
            return Err(HardlinkError::MissingSource(source_dir.display().to_string()));
        }

        std::fs::create_dir_all(target_dir).map_err(|err| map_io(source_dir, target_dir, err))?;

        let mut summary = MirrorSummary::default();

        for entry in WalkDir::new(source_dir).min_depth(1).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable entry during mirror");
                    summary.failed += 1;
                    continue;
                }
            };

            let relative = match entry.path().strip_prefix(source_dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let target = target_dir.join(relative);

            if entry.file_type().is_dir() {
                if let Err(err) = std::fs::create_dir_all(&target) {
                    warn!(path = %target.display(), error = %err, "Failed to create directory, skipping subtree entries");
                    summary.failed += 1;
                }
                continue;
            }

            match self.create_hardlink(entry.path(), &target) {
                Ok(LinkOutcome::Created) => summary.linked += 1,
                Ok(LinkOutcome::AlreadyExists) => summary.skipped += 1,
                Err(err) => {
                    warn!(
                        source = %entry.path().display(),
                        target = %target.display(),
                        error = %err,
                        "Failed to link file, skipping"
                    );
                    summary.failed += 1;
                }
            }
        }

        debug!(
            source = %source_dir.display(),
            target = %target_dir.display(),
            linked = summary.linked,
            skipped = summary.skipped,
            failed = summary.failed,
            "Directory mirrored"
        );

        Ok(summary)
    }
}

fn map_io(source: &Path, target: &Path, err: io::Error) -> HardlinkError {
    const EXDEV: i32 = 18;

    if err.kind() == io::ErrorKind::PermissionDenied {
        return HardlinkError::PermissionDenied {
            source_path: source.display().to_string(),
            target: target.display().to_string(),
        };
    }
    if err.raw_os_error() == Some(EXDEV) {
        return HardlinkError::CrossDevice {
            source_path: source.display().to_string(),
            target: target.display().to_string(),
        };
    }
    HardlinkError::Io {
        source_path: source.display().to_string(),
        target: target.display().to_string(),
        err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_hardlink_and_idempotent_rerun() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        let target = dir.path().join("out/linked.mkv");
        std::fs::write(&source, b"payload").unwrap();

        let svc = HardlinkService::new();
        assert_eq!(
            svc.create_hardlink(&source, &target).unwrap(),
            LinkOutcome::Created
        );
        // Second call with identical arguments is a no-op, not an error
        assert_eq!(
            svc.create_hardlink(&source, &target).unwrap(),
            LinkOutcome::AlreadyExists
        );
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn test_io_errors_are_classified_with_both_paths() {
        let source = Path::new("/lib/a.mkv");
        let target = Path::new("/media/T/a.mkv");

        let denied = map_io(source, target, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, HardlinkError::PermissionDenied { .. }));
        assert!(denied.is_non_retryable());
        assert!(denied.to_string().contains("/lib/a.mkv"));
        assert!(denied.to_string().contains("/media/T/a.mkv"));

        let exdev = map_io(source, target, io::Error::from_raw_os_error(18));
        assert!(matches!(exdev, HardlinkError::CrossDevice { .. }));
        assert!(exdev.is_non_retryable());

        let other = map_io(source, target, io::Error::from(io::ErrorKind::Interrupted));
        assert!(matches!(other, HardlinkError::Io { .. }));
        assert!(!other.is_non_retryable());
    }

    #[test]
    fn test_missing_source_is_reported() {
        let dir = tempdir().unwrap();
        let svc = HardlinkService::new();
        let err = svc
            .create_hardlink(&dir.path().join("nope.mkv"), &dir.path().join("t.mkv"))
            .unwrap_err();
        assert!(matches!(err, HardlinkError::MissingSource(_)));
    }

    #[test]
    fn test_recursive_mirror() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("disc");
        std::fs::create_dir_all(src.join("BDMV/STREAM")).unwrap();
        std::fs::write(src.join("BDMV/STREAM/00000.m2ts"), b"video").unwrap();
        std::fs::write(src.join("BDMV/index.bdmv"), b"index").unwrap();

        let target = dir.path().join("out");
        let svc = HardlinkService::new();
        let summary = svc.create_hardlink_recursively(&src, &target).unwrap();

        assert_eq!(summary.linked, 2);
        assert_eq!(summary.failed, 0);
        assert!(target.join("BDMV/STREAM/00000.m2ts").exists());
        assert!(target.join("BDMV/index.bdmv").exists());
    }

    #[test]
    fn test_recursive_mirror_is_idempotent() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("disc");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("movie.mkv"), b"x").unwrap();

        let target = dir.path().join("out");
        let svc = HardlinkService::new();
        svc.create_hardlink_recursively(&src, &target).unwrap();
        let second = svc.create_hardlink_recursively(&src, &target).unwrap();

        assert_eq!(second.linked, 0);
        assert_eq!(second.skipped, 1);
    }
}
