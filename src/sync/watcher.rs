//! File system watcher for the cache side of a mount.
//!
//! Wraps the notify crate and translates raw notifications into
//! [`WatchEvent`]s carrying one path each.

use crate::error::{CacheError, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc as async_mpsc;
use tracing::warn;

/// Kind of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// File or directory was created.
    Created,
    /// File contents changed.
    Changed,
    /// File or directory was deleted.
    Deleted,
    /// File or directory was renamed; the event carries the old path.
    Renamed,
}

/// A file system watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Previous path for renames.
    pub from: Option<PathBuf>,
    /// Whether this affects a directory.
    pub is_dir: bool,
}

impl WatchEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_dir = path.is_dir();
        Self {
            kind,
            path,
            from: None,
            is_dir,
        }
    }

    /// Translate a notify event. Access and metadata-only events produce nothing.
    pub fn from_notify(event: Event) -> Vec<Self> {
        let Event { kind, paths, .. } = event;
        let each = |kind: ChangeKind, paths: Vec<PathBuf>| -> Vec<Self> {
            paths.into_iter().map(|p| WatchEvent::new(kind, p)).collect()
        };

        match kind {
            EventKind::Create(_) => each(ChangeKind::Created, paths),
            EventKind::Remove(_) => paths
                .into_iter()
                .map(|path| WatchEvent {
                    kind: ChangeKind::Deleted,
                    path,
                    from: None,
                    is_dir: false,
                })
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                let mut paths = paths.into_iter();
                let (from, to) = match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => (from, to),
                    _ => return Vec::new(),
                };
                let mut event = WatchEvent::new(ChangeKind::Renamed, to);
                event.from = Some(from);
                vec![event]
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                each(ChangeKind::Deleted, paths)
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeKind::Created, paths),
            EventKind::Modify(ModifyKind::Name(_)) => paths
                .into_iter()
                .map(|p| {
                    let kind = if p.exists() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Deleted
                    };
                    WatchEvent::new(kind, p)
                })
                .collect(),
            EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
            EventKind::Modify(_) => paths
                .into_iter()
                .filter(|p| !p.is_dir())
                .map(|p| WatchEvent::new(ChangeKind::Changed, p))
                .collect(),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        }
    }
}

/// Office lock files, editor swap files and similar scratch files.
pub fn is_temporary(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    name.starts_with('~')
        || name.starts_with(".tmp")
        || name.ends_with(".tmp")
        || name.ends_with(".temp")
        || name.contains("~$")
}

/// Recursive watcher delivering events on a tokio channel.
pub struct CacheWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    sender: async_mpsc::UnboundedSender<WatchEvent>,
}

impl CacheWatcher {
    /// Start watching `root` recursively.
    pub fn new(root: &Path) -> Result<(Self, async_mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = async_mpsc::unbounded_channel();
        let watch_err = |source| CacheError::Watch {
            path: root.to_path_buf(),
            source,
        };

        let sender = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for watch_event in WatchEvent::from_notify(event) {
                        let _ = sender.send(watch_event);
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(watch_err)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_err)?;

        Ok((
            Self {
                _watcher: watcher,
                root: root.to_path_buf(),
                sender: tx,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sender feeding the same channel as the OS notifications.
    pub fn sender(&self) -> async_mpsc::UnboundedSender<WatchEvent> {
        self.sender.clone()
    }
}

/// Event debouncer to avoid duplicate events.
///
/// Repeats of the same path and kind inside the window are dropped.
#[derive(Debug)]
pub struct EventDebouncer {
    window: Duration,
    recent: HashMap<(PathBuf, ChangeKind), Instant>,
}

impl EventDebouncer {
    /// Create a new debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
        }
    }

    /// Check if an event should be processed (not a duplicate).
    pub fn should_process(&mut self, event: &WatchEvent) -> bool {
        self.should_process_at(event, Instant::now())
    }

    pub fn should_process_at(&mut self, event: &WatchEvent, now: Instant) -> bool {
        let window = self.window;
        // Clean up old events
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        let key = (event.path.clone(), event.kind);
        if self.recent.contains_key(&key) {
            return false;
        }
        self.recent.insert(key, now);
        true
    }
}
