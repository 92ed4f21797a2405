//! Directory redirection management.
//!
//! A redirection makes one directory path transparently resolve to another
//! without copying data. On Windows this is a mount-point reparse point
//! (a directory junction) written through [`buffer::MountPointData`]. Other
//! hosts fall back to a directory symlink so the lifecycle can run anywhere.

pub mod buffer;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

#[cfg(not(windows))]
mod unix;
#[cfg(not(windows))]
use unix as platform;

use crate::error::{CacheError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub use buffer::{MountPointData, IO_REPARSE_TAG_MOUNT_POINT};

/// Outcome of [`ReparseManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectionStatus {
    /// Redirection resolves to the expected live directory.
    Valid,
    /// Path is not a redirection at all.
    NotARedirection,
    /// Redirection exists but its target could not be read.
    Unreadable,
    /// Target resolves but is not an existing directory.
    TargetMissing(PathBuf),
    /// Target resolves to somewhere else.
    Mismatch(PathBuf),
}

impl RedirectionStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, RedirectionStatus::Valid)
    }
}

/// Creates, removes and inspects directory redirections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReparseManager;

impl ReparseManager {
    pub fn new() -> Self {
        Self
    }

    /// Create `mount` as a redirection to the existing directory `target`.
    pub fn create(&self, mount: &Path, target: &Path) -> Result<()> {
        if !target.is_dir() {
            return Err(if target.exists() {
                CacheError::NotADirectory {
                    path: target.to_path_buf(),
                }
            } else {
                CacheError::NotFound {
                    path: target.to_path_buf(),
                }
            });
        }
        if mount.symlink_metadata().is_ok() {
            return Err(CacheError::AlreadyExists {
                path: mount.to_path_buf(),
            });
        }

        let target = absolute(target);
        debug!("Creating redirection {} -> {}", mount.display(), target.display());
        platform::create_redirection(mount, &target)
    }

    /// Remove the redirection at `mount`, leaving nothing behind.
    pub fn remove(&self, mount: &Path) -> Result<()> {
        if !self.is_redirection(mount) {
            return Err(CacheError::NotARedirection {
                path: mount.to_path_buf(),
            });
        }
        debug!("Removing redirection {}", mount.display());
        platform::remove_redirection(mount)
    }

    /// Attribute check; false on any access error.
    pub fn is_redirection(&self, path: &Path) -> bool {
        platform::is_redirection(path)
    }

    /// Decoded target of the redirection, if it is one of ours.
    pub fn resolve_target(&self, mount: &Path) -> Option<PathBuf> {
        if !self.is_redirection(mount) {
            return None;
        }
        match platform::read_target(mount) {
            Ok(target) => Some(target),
            Err(e) => {
                warn!("Failed to read redirection target of {}: {}", mount.display(), e);
                None
            }
        }
    }

    /// Check that `mount` redirects to the live directory `expected`.
    pub fn validate(&self, mount: &Path, expected: &Path) -> RedirectionStatus {
        if !self.is_redirection(mount) {
            return RedirectionStatus::NotARedirection;
        }
        let Some(target) = self.resolve_target(mount) else {
            return RedirectionStatus::Unreadable;
        };
        if !target.is_dir() {
            return RedirectionStatus::TargetMissing(target);
        }
        if !paths_equal(&target, expected) {
            return RedirectionStatus::Mismatch(target);
        }
        RedirectionStatus::Valid
    }

    /// Set or clear the hidden attribute. No-op where unsupported.
    pub fn set_hidden(&self, path: &Path, hidden: bool) -> Result<()> {
        platform::set_hidden(path, hidden)
    }
}

/// Fully qualify a path without touching the filesystem.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Compare two paths fully qualified and case-insensitively.
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    normalize(a) == normalize(b)
}

/// Canonical text form used by [`paths_equal`]; usable as a map key.
pub fn normalize(path: &Path) -> String {
    let path = absolute(path);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    let text = out.to_string_lossy().replace('/', "\\");
    let text = text
        .strip_prefix(r"\\?\")
        .or_else(|| text.strip_prefix(buffer::NT_PATH_PREFIX))
        .unwrap_or(&text);
    let trimmed = text.trim_end_matches('\\');
    let trimmed = if trimmed.is_empty() { "\\" } else { trimmed };
    trimmed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_equal_ignores_case_and_trailing_separator() {
        assert!(paths_equal(Path::new("/Data/Cache/"), Path::new("/data/cache")));
        assert!(paths_equal(Path::new("/data/./x/../cache"), Path::new("/data/cache")));
        assert!(!paths_equal(Path::new("/data/cache"), Path::new("/data/cache2")));
    }

    #[test]
    fn test_create_resolve_remove() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let mount = dir.path().join("mount");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("file.txt"), b"hello").unwrap();

        let manager = ReparseManager::new();
        manager.create(&mount, &target).unwrap();

        assert!(manager.is_redirection(&mount));
        assert!(!manager.is_redirection(&target));
        assert!(paths_equal(&manager.resolve_target(&mount).unwrap(), &target));
        assert_eq!(std::fs::read(mount.join("file.txt")).unwrap(), b"hello");
        assert_eq!(manager.validate(&mount, &target), RedirectionStatus::Valid);

        manager.remove(&mount).unwrap();
        assert!(!mount.exists());
        assert!(target.join("file.txt").exists());
    }

    #[test]
    fn test_create_rejects_missing_target_and_existing_mount() {
        let dir = tempdir().unwrap();
        let manager = ReparseManager::new();
        let existing = dir.path().join("existing");
        std::fs::create_dir(&existing).unwrap();

        let err = manager
            .create(&dir.path().join("m"), &dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));

        let err = manager.create(&existing, dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists { .. }));
        assert!(existing.is_dir());
    }

    #[test]
    fn test_remove_rejects_plain_directory() {
        let dir = tempdir().unwrap();
        let manager = ReparseManager::new();
        let err = manager.remove(dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::NotARedirection { .. }));
        assert!(dir.path().is_dir());
    }

    #[test]
    fn test_validate_reports_mismatch_and_missing_target() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mount = dir.path().join("mount");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let manager = ReparseManager::new();
        assert_eq!(manager.validate(&a, &b), RedirectionStatus::NotARedirection);

        manager.create(&mount, &a).unwrap();
        assert!(matches!(manager.validate(&mount, &b), RedirectionStatus::Mismatch(_)));

        std::fs::remove_dir(&a).unwrap();
        assert!(matches!(
            manager.validate(&mount, &a),
            RedirectionStatus::TargetMissing(_)
        ));
        manager.remove(&mount).unwrap();
    }

    #[test]
    fn test_is_redirection_on_missing_path() {
        assert!(!ReparseManager::new().is_redirection(Path::new("/definitely/not/here")));
    }
}
