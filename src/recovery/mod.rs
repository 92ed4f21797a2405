//! Recovery supervisor.
//!
//! Turns the error history of each mount into at most one recovery action
//! and runs it through [`RecoveryActions`]. Time is always passed in, so the
//! strategy rules can be exercised without waiting.

pub mod state;
pub mod strategy;
pub mod supervisor;

pub use state::{AccelerationState, ErrorRecord, Severity};
pub use strategy::{determine_strategy, RecoveryStrategy};
pub use supervisor::{
    ErrorStatistics, HealthReport, RecoveryActions, RecoveryOutcome, RecoveryRequest,
    RecoverySettings, RecoverySupervisor,
};
