//! Mapping from error history to a recovery action.

use super::state::{AccelerationState, Severity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Look-back window for strategy selection.
pub const ERROR_WINDOW_MINUTES: i64 = 30;
const RECREATE_HIGH_ERRORS: usize = 3;
const RESET_ERRORS: usize = 5;
const RETRY_ATTEMPT_LIMIT: u32 = 3;
const RETRY_COOLDOWN_MINUTES: i64 = 5;
const FALLBACK_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    None,
    /// Re-validate, then force one resync if validation fails.
    Retry,
    /// Stop with the cache kept, then accelerate again.
    Reset,
    /// Stop and delete the cache, then accelerate from scratch.
    Recreate,
    /// Stop for good and leave the original in place.
    Fallback,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pick the recovery strategy for `state` as of `now`.
///
/// Rules apply in order: three High or worse errors in the window means
/// Recreate, five errors of any severity means Reset, a cooled-down mount
/// with few attempts gets a Retry, and a mount past five attempts falls back.
pub fn determine_strategy(state: &AccelerationState, now: DateTime<Utc>) -> RecoveryStrategy {
    let window = Duration::minutes(ERROR_WINDOW_MINUTES);
    let recent: Vec<_> = state.errors_within(now, window).collect();
    let high = recent.iter().filter(|e| e.severity >= Severity::High).count();

    if high >= RECREATE_HIGH_ERRORS {
        return RecoveryStrategy::Recreate;
    }
    if recent.len() >= RESET_ERRORS {
        return RecoveryStrategy::Reset;
    }

    let cooled_down = state
        .last_recovery_attempt
        .map(|last| now - last >= Duration::minutes(RETRY_COOLDOWN_MINUTES))
        .unwrap_or(true);
    if state.recovery_attempts < RETRY_ATTEMPT_LIMIT && cooled_down {
        return RecoveryStrategy::Retry;
    }
    if state.recovery_attempts >= FALLBACK_ATTEMPTS {
        return RecoveryStrategy::Fallback;
    }
    RecoveryStrategy::None
}

/// Wait before an automatic attempt: 2^attempts minutes, capped.
pub fn schedule_delay(attempts: u32, cap: std::time::Duration) -> std::time::Duration {
    let minutes = 1u64.checked_shl(attempts.min(32)).unwrap_or(u64::MAX);
    let delay = std::time::Duration::from_secs(minutes.saturating_mul(60));
    delay.min(cap)
}
