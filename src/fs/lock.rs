//! File lock checks and backoff.
//!
//! Windows enforces share modes, so "locked" has a real meaning there:
//! another handle denies read sharing, or is open for writing. Unix has only
//! advisory locks; the checks fall back to existence plus size stability.

use crate::error::{is_sharing_violation, CacheError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Sum of all delays if every attempt fails.
    pub fn total(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1)).map(|a| self.delay(a)).sum()
    }
}

/// State of a file as seen by an exclusive-open check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nobody else holds it.
    Free,
    /// Another handle is using it.
    Busy,
    /// The path no longer exists.
    Vanished,
}

/// Try to open `path` exclusively.
pub fn check_exclusive(path: &Path) -> LockState {
    match open_exclusive(path) {
        Ok(_) => LockState::Free,
        Err(e) if e.kind() == io::ErrorKind::NotFound => LockState::Vanished,
        Err(e) if is_sharing_violation(&e) => LockState::Busy,
        Err(e) => {
            debug!("Exclusive check of {} failed: {}", path.display(), e);
            LockState::Busy
        }
    }
}

/// True when another process holds `path` such that it cannot be read.
pub fn is_exclusively_locked(path: &Path) -> bool {
    matches!(File::open(path), Err(e) if is_sharing_violation(&e))
}

/// A shared read handle that keeps writers out while held.
#[derive(Debug)]
pub struct ReadLock {
    _file: File,
}

/// One attempt at a shared read lock.
pub fn try_read_lock(path: &Path) -> io::Result<ReadLock> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ only: concurrent readers yes, writers no
        options.share_mode(0x0000_0001);
    }
    options.open(path).map(|file| ReadLock { _file: file })
}

/// Acquire a shared read lock, retrying with `backoff` while the file is held.
///
/// Returns `NotFound` at once if the file disappears, `Locked` when attempts
/// run out, and stops early if `cancel` fires.
pub async fn acquire_read_lock(
    path: &Path,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<ReadLock> {
    let attempts = backoff.max_attempts.max(1);
    for attempt in 0..attempts {
        match try_read_lock(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if is_sharing_violation(&e) || e.kind() == io::ErrorKind::PermissionDenied => {
                if attempt + 1 == attempts {
                    break;
                }
                let delay = backoff.delay(attempt);
                debug!(
                    "{} is locked, retry {}/{} in {:?}",
                    path.display(),
                    attempt + 1,
                    attempts,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(CacheError::io(e, "locking for read", path)),
        }
    }
    Err(CacheError::Locked {
        path: path.to_path_buf(),
        attempts,
    })
}

/// Whether a freshly changed file is ready to replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Complete,
    Vanished,
}

/// Wait until `path` is no longer being written.
///
/// Ready means the size held still across one `settle` interval and the
/// exclusive check succeeds. After `max_checks` unsuccessful rounds the file
/// is reported complete anyway; the read-lock backoff takes over from there.
pub async fn wait_for_write_complete(
    path: &Path,
    settle: Duration,
    max_checks: u32,
    cancel: &CancellationToken,
) -> WriteState {
    for _ in 0..max_checks.max(1) {
        let Ok(before) = std::fs::metadata(path).map(|m| m.len()) else {
            return WriteState::Vanished;
        };
        tokio::select! {
            _ = cancel.cancelled() => return WriteState::Complete,
            _ = tokio::time::sleep(settle) => {}
        }
        let Ok(after) = std::fs::metadata(path).map(|m| m.len()) else {
            return WriteState::Vanished;
        };
        if before != after {
            continue;
        }
        match check_exclusive(path) {
            LockState::Free => return WriteState::Complete,
            LockState::Vanished => return WriteState::Vanished,
            LockState::Busy => {}
        }
    }
    WriteState::Complete
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new().read(true).share_mode(0).open(path)
}

#[cfg(not(windows))]
fn open_exclusive(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
        // seven waits between eight attempts: 1+2+4+8+16+32+60
        assert_eq!(backoff.total(), Duration::from_secs(123));
    }

    #[test]
    fn test_lock_states() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        assert_eq!(check_exclusive(&path), LockState::Vanished);
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(check_exclusive(&path), LockState::Free);
        assert!(!is_exclusively_locked(&path));
    }

    #[tokio::test]
    async fn test_acquire_read_lock_missing_file() {
        let dir = tempdir().unwrap();
        let err = acquire_read_lock(
            &dir.path().join("missing"),
            &Backoff::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_write_complete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let cancel = CancellationToken::new();

        assert_eq!(
            wait_for_write_complete(&path, Duration::from_millis(10), 3, &cancel).await,
            WriteState::Vanished
        );

        std::fs::write(&path, b"done").unwrap();
        assert_eq!(
            wait_for_write_complete(&path, Duration::from_millis(10), 3, &cancel).await,
            WriteState::Complete
        );
    }
}
