//! Textual progress reporting.
//!
//! Long-running operations (copy, sync, recovery) report human-readable
//! progress through a [`Progress`] sink. Consumers must tolerate any call
//! frequency; only the operation's return value is authoritative.

use std::fmt;
use std::sync::Arc;

/// A cloneable, optional progress sink.
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Progress {
    /// Create a sink that forwards every message to `f`.
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(f)),
        }
    }

    /// A sink that discards everything.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Report a message.
    pub fn report(&self, message: impl AsRef<str>) {
        if let Some(sink) = &self.sink {
            sink(message.as_ref());
        }
    }

    pub fn is_silent(&self) -> bool {
        self.sink.is_none()
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("silent", &self.is_silent())
            .finish()
    }
}
