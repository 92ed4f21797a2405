use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One recorded failure for a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Short tag such as `HealthCheck` or `SyncFailed`.
    pub kind: String,
    pub message: String,
    pub severity: Severity,
}

/// Health record the supervisor keeps for each mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccelerationState {
    pub mount_point: PathBuf,
    pub original_path: PathBuf,
    pub cache_path: PathBuf,
    pub is_active: bool,
    pub errors: Vec<ErrorRecord>,
    pub recovery_attempts: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
}

impl AccelerationState {
    pub fn new(
        mount_point: impl Into<PathBuf>,
        original_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            original_path: original_path.into(),
            cache_path: cache_path.into(),
            is_active: true,
            errors: Vec::new(),
            recovery_attempts: 0,
            last_recovery_attempt: None,
        }
    }

    /// Errors recorded strictly after `now - window`.
    pub fn errors_within(&self, now: DateTime<Utc>, window: Duration) -> impl Iterator<Item = &ErrorRecord> {
        let since = now - window;
        self.errors.iter().filter(move |e| e.at > since)
    }

    pub fn clear_history(&mut self) {
        self.errors.clear();
        self.recovery_attempts = 0;
    }
}
