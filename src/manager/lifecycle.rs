use serde::Serialize;
use std::fmt;

/// Where a mount is in its acceleration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum LifecycleState {
    #[default]
    Unaccelerated,
    Initializing,
    Accelerated,
    /// Accelerated, but errors were recorded since the last recovery.
    Degraded,
    Stopping,
}

impl LifecycleState {
    /// Whether `self → next` is a legal transition.
    pub fn can_become(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unaccelerated, Initializing)
                | (Initializing, Accelerated)
                | (Initializing, Unaccelerated)
                | (Accelerated, Degraded)
                | (Accelerated, Stopping)
                | (Degraded, Accelerated)
                | (Degraded, Degraded)
                | (Degraded, Stopping)
                | (Stopping, Unaccelerated)
                | (Stopping, Degraded)
        )
    }

    /// Accelerated or Degraded.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Accelerated | LifecycleState::Degraded)
    }

    pub fn is_transitional(self) -> bool {
        matches!(self, LifecycleState::Initializing | LifecycleState::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
