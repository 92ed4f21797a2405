//! Sync engine for cache → original replication.
//!
//! A watcher per mount feeds debounced events into a de-duplicated queue.
//! Files are copied through the verified copy engine; directories and
//! deletions are applied directly.

pub mod engine;
pub mod queue;
pub mod watcher;

pub use engine::{ForceSyncReport, SyncEngine, SyncEvent, SyncSettings, SyncStats};
pub use queue::{QueueItem, QueueStatus, SyncConfiguration, SyncMode, SyncOperation, SyncQueue};
pub use watcher::{is_temporary, CacheWatcher, ChangeKind, EventDebouncer, WatchEvent};
