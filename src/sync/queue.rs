//! Sync operations and the observable queue.

use super::watcher::ChangeKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How changes under a mount reach the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Replicate as soon as the file is idle.
    #[default]
    Immediate,
    /// Hold changes for the periodic sweep.
    Periodic,
}

/// Per-mount sync policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub cache_path: PathBuf,
    pub original_path: PathBuf,
    pub mode: SyncMode,
    /// Upper bound, in seconds, on how long a pending change may wait.
    pub delay_seconds: u64,
    pub enabled: bool,
}

impl SyncConfiguration {
    pub fn new(cache_path: impl Into<PathBuf>, original_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            original_path: original_path.into(),
            mode: SyncMode::Immediate,
            delay_seconds: 3,
            enabled: true,
        }
    }

    pub fn with_mode(mut self, mode: SyncMode, delay_seconds: u64) -> Self {
        self.mode = mode;
        self.delay_seconds = delay_seconds;
        self
    }
}

/// One pending replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOperation {
    /// Changed path under `source_root`.
    pub path: PathBuf,
    /// Old path for renames.
    pub from: Option<PathBuf>,
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
    pub queued_at: DateTime<Utc>,
    pub size: u64,
    pub mode: SyncMode,
    pub delay: Duration,
}

/// Serialization key: the same path and kind never run twice at once.
pub type DedupKey = (PathBuf, ChangeKind);

impl SyncOperation {
    /// Build an operation without touching the filesystem; size and
    /// directory flag come from [`SyncOperation::with_metadata`].
    pub fn new(config: &SyncConfiguration, kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            is_dir: false,
            size: 0,
            path: path.into(),
            from: None,
            source_root: config.cache_path.clone(),
            target_root: config.original_path.clone(),
            kind,
            queued_at: Utc::now(),
            mode: config.mode,
            delay: Duration::from_secs(config.delay_seconds),
        }
    }

    pub fn with_from(mut self, from: Option<PathBuf>) -> Self {
        self.from = from;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<&Metadata>) -> Self {
        if let Some(metadata) = metadata {
            self.is_dir = metadata.is_dir();
            self.size = if metadata.is_file() { metadata.len() } else { 0 };
        }
        self
    }

    pub fn with_is_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// Fill in size and directory flag from the current filesystem state.
    pub async fn refreshed(self) -> Self {
        let metadata = tokio::fs::metadata(&self.path).await.ok();
        self.with_metadata(metadata.as_ref())
    }

    pub fn key(&self) -> DedupKey {
        (self.path.clone(), self.kind)
    }

    /// Path relative to the source root.
    pub fn relative(&self) -> Option<&Path> {
        self.path.strip_prefix(&self.source_root).ok()
    }

    /// Where the change lands in the original tree.
    pub fn target(&self) -> Option<PathBuf> {
        self.relative().map(|r| self.target_root.join(r))
    }

    /// Where the old path of a rename lives in the original tree.
    pub fn from_target(&self) -> Option<PathBuf> {
        let from = self.from.as_ref()?;
        from.strip_prefix(&self.source_root)
            .ok()
            .map(|r| self.target_root.join(r))
    }

    /// Whether the operation has waited at least its configured delay.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let waited = now.signed_duration_since(self.queued_at);
        waited.to_std().map(|w| w >= self.delay).unwrap_or(false)
    }
}

/// Lifecycle of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Waiting,
    Processing,
    Done,
    Failed,
}

/// User-visible projection of a sync operation.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: u64,
    pub operation: SyncOperation,
    pub status: QueueStatus,
    /// Percentage 0..=100.
    pub progress: f64,
    pub error: Option<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn file_name(&self) -> String {
        self.operation
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Ordered table of queue items.
#[derive(Debug, Default)]
pub struct SyncQueue {
    items: BTreeMap<u64, QueueItem>,
    next_id: u64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a Waiting item and return a copy of it.
    pub fn push(&mut self, operation: SyncOperation, now: DateTime<Utc>) -> QueueItem {
        self.next_id += 1;
        let item = QueueItem {
            id: self.next_id,
            size: operation.size,
            operation,
            status: QueueStatus::Waiting,
            progress: 0.0,
            error: None,
            created_at: now,
            completed_at: None,
        };
        self.items.insert(item.id, item.clone());
        item
    }

    pub fn get(&self, id: u64) -> Option<&QueueItem> {
        self.items.get(&id)
    }

    pub fn start(&mut self, id: u64) -> Option<QueueItem> {
        let item = self.items.get_mut(&id)?;
        item.status = QueueStatus::Processing;
        item.error = None;
        Some(item.clone())
    }

    pub fn set_progress(&mut self, id: u64, progress: f64) -> Option<QueueItem> {
        let item = self.items.get_mut(&id)?;
        if item.status != QueueStatus::Processing {
            return None;
        }
        item.progress = progress.clamp(0.0, 100.0);
        Some(item.clone())
    }

    pub fn complete(&mut self, id: u64, now: DateTime<Utc>) -> Option<QueueItem> {
        let item = self.items.get_mut(&id)?;
        item.status = QueueStatus::Done;
        item.progress = 100.0;
        item.completed_at = Some(now);
        Some(item.clone())
    }

    pub fn fail(&mut self, id: u64, error: String, now: DateTime<Utc>) -> Option<QueueItem> {
        let item = self.items.get_mut(&id)?;
        item.status = QueueStatus::Failed;
        item.error = Some(error);
        item.completed_at = Some(now);
        Some(item.clone())
    }

    /// Remove Done items completed at least `retention` ago.
    pub fn purge_done(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<u64> {
        let expired: Vec<u64> = self
            .items
            .values()
            .filter(|item| item.status == QueueStatus::Done)
            .filter(|item| {
                item.completed_at
                    .and_then(|at| now.signed_duration_since(at).to_std().ok())
                    .map(|age| age >= retention)
                    .unwrap_or(false)
            })
            .map(|item| item.id)
            .collect();
        for id in &expired {
            self.items.remove(id);
        }
        expired
    }

    /// Remove every item in `status`.
    pub fn remove_status(&mut self, status: QueueStatus) -> Vec<u64> {
        let ids: Vec<u64> = self
            .items
            .values()
            .filter(|item| item.status == status)
            .map(|item| item.id)
            .collect();
        for id in &ids {
            self.items.remove(id);
        }
        ids
    }

    /// Take all failed items out of the table for another attempt.
    pub fn take_failed(&mut self) -> Vec<QueueItem> {
        let ids = self
            .items
            .values()
            .filter(|item| item.status == QueueStatus::Failed)
            .map(|item| item.id)
            .collect::<Vec<_>>();
        ids.iter().filter_map(|id| self.items.remove(id)).collect()
    }

    /// Drop items whose operation belongs to `source_root`.
    pub fn remove_root(&mut self, source_root: &Path) -> Vec<u64> {
        let ids: Vec<u64> = self
            .items
            .values()
            .filter(|item| item.operation.source_root == source_root)
            .filter(|item| item.status != QueueStatus::Processing)
            .map(|item| item.id)
            .collect();
        for id in &ids {
            self.items.remove(id);
        }
        ids
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.items.values().cloned().collect()
    }

    pub fn count(&self, status: QueueStatus) -> usize {
        self.items.values().filter(|i| i.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
