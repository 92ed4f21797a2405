// Library module for cachemax
// Re-exports modules for use in integration tests and the binary

pub mod config;
pub mod copy;
pub mod error;
pub mod fs;
pub mod hash;
pub mod manager;
pub mod progress;
pub mod recovery;
pub mod reparse;
pub mod scheduler;
pub mod sync;

pub use error::{CacheError, ErrorClass, Result};
pub use manager::CacheManager;
pub use progress::Progress;
