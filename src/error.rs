// Centralized error handling module
// Error types carrying the path and operation that failed

use std::io;
use std::path::PathBuf;

/// Broad class of a failure, used to decide whether it is retried,
/// escalated to recovery, or reported straight back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or wrong-type path, insufficient space. Nothing was mutated.
    Precondition,
    /// Locked file or busy redirection. Retried with backoff before surfacing.
    Contention,
    /// Hash or byte mismatch. Always fatal for the operation.
    Integrity,
    /// Redirection drifted, original or cache missing.
    Consistency,
    /// Anything unanticipated.
    Fatal,
}

/// Main error type for the cache engine
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("path not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("not a file: {}", path.display())]
    NotAFile { path: PathBuf },

    #[error("path already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("already accelerated: {}", path.display())]
    AlreadyAccelerated { path: PathBuf },

    #[error("not a redirection: {}", path.display())]
    NotARedirection { path: PathBuf },

    #[error("{} is busy ({state})", path.display())]
    Busy { path: PathBuf, state: String },

    #[error("no acceleration recorded for {}", path.display())]
    UnknownMount { path: PathBuf },

    #[error("permission denied while {operation}: {}", path.display())]
    PermissionDenied { path: PathBuf, operation: String },

    #[error(
        "insufficient space for {}: need {required} bytes, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("file is locked: {} (after {attempts} attempts)", path.display())]
    Locked { path: PathBuf, attempts: u32 },

    #[error("verification failed for {}: {reason}", path.display())]
    VerificationFailed { path: PathBuf, reason: String },

    #[error("invalid reparse data: {reason}")]
    InvalidReparseData { reason: String },

    #[error("unsupported on this platform: {operation}")]
    Unsupported { operation: String },

    #[error("configuration error at {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("I/O error while {operation}{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Io {
        path: Option<PathBuf>,
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("{cause}; rollback also failed: {}", rollback.join("; "))]
    RollbackFailed {
        cause: Box<CacheError>,
        rollback: Vec<String>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Create an error from io::Error with context about the operation and optional path
    pub fn from_io_error(err: io::Error, operation: &str, path: Option<PathBuf>) -> Self {
        match (err.kind(), path) {
            (io::ErrorKind::NotFound, Some(path)) => CacheError::NotFound { path },
            (io::ErrorKind::PermissionDenied, Some(path)) => CacheError::PermissionDenied {
                path,
                operation: operation.to_string(),
            },
            (_, path) => CacheError::Io {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }

    /// Shorthand for an io error tied to a specific path.
    pub fn io(err: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        Self::from_io_error(err, operation, Some(path.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CacheError::Internal {
            message: message.into(),
        }
    }

    /// Classify the error for retry and escalation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::NotFound { .. }
            | CacheError::NotADirectory { .. }
            | CacheError::NotAFile { .. }
            | CacheError::AlreadyExists { .. }
            | CacheError::AlreadyAccelerated { .. }
            | CacheError::NotARedirection { .. }
            | CacheError::UnknownMount { .. }
            | CacheError::PermissionDenied { .. }
            | CacheError::InsufficientSpace { .. }
            | CacheError::Unsupported { .. }
            | CacheError::Config { .. } => ErrorClass::Precondition,
            CacheError::Locked { .. } | CacheError::Busy { .. } => ErrorClass::Contention,
            CacheError::VerificationFailed { .. } => ErrorClass::Integrity,
            CacheError::InvalidReparseData { .. } => ErrorClass::Consistency,
            CacheError::Io { source, .. } if is_sharing_violation(source) => ErrorClass::Contention,
            CacheError::RollbackFailed { cause, .. } => cause.class(),
            CacheError::Watch { .. } | CacheError::Io { .. } | CacheError::Internal { .. } => {
                ErrorClass::Fatal
            }
        }
    }

    /// Whether the failure is worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Contention)
            || matches!(self, CacheError::Io { source, .. } if matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ))
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::internal(format!("background task failed: {err}"))
    }
}

/// ERROR_SHARING_VIOLATION (32) and ERROR_LOCK_VIOLATION (33) on Windows.
pub(crate) fn is_sharing_violation(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(32) | Some(33)) && cfg!(windows)
        || err.kind() == io::ErrorKind::WouldBlock
}
