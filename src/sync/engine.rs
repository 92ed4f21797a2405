//! Cache → original replication engine.
//!
//! Each monitored cache directory gets a watcher task. Events are debounced,
//! filtered and, for files, held until writes settle. They then either run at
//! once (Immediate mode) or wait in the pending list for a sweep (Periodic
//! mode). Every run is tracked as a [`QueueItem`] so callers can observe it.

use super::queue::{
    DedupKey, QueueItem, QueueStatus, SyncConfiguration, SyncMode, SyncOperation, SyncQueue,
};
use super::watcher::{is_temporary, CacheWatcher, ChangeKind, EventDebouncer, WatchEvent};
use crate::copy::engine::percent;
use crate::copy::{verify::DATE_TOLERANCE, ByteProgress, CopyOptions, VerifiedCopyEngine};
use crate::error::{CacheError, Result};
use crate::fs::lock::{acquire_read_lock, wait_for_write_complete, Backoff, WriteState};
use crate::fs::tree::{self, TreeFile};
use crate::progress::Progress;
use crate::scheduler::{Scheduler, Tick, TickKind};
use chrono::Utc;
use humansize::{format_size, BINARY};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Repeats of the same path and kind inside this window are coalesced.
    pub debounce: Duration,
    /// Interval a file's size must hold still before it counts as written.
    pub write_settle: Duration,
    /// Settle rounds before giving up and deferring to the lock backoff.
    pub write_checks: u32,
    /// Retry policy for files held by another process.
    pub lock_backoff: Backoff,
    /// Simultaneous file copies across all mounts.
    pub max_concurrent_copies: usize,
    /// How long a Done item stays visible.
    pub done_retention: Duration,
    pub fast_sweep_interval: Duration,
    pub periodic_sweep_interval: Duration,
    pub cleanup_interval: Duration,
    /// Extra attempts for deleting a replicated path.
    pub delete_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            write_settle: Duration::from_secs(1),
            write_checks: 10,
            lock_backoff: Backoff::default(),
            max_concurrent_copies: 4,
            done_retention: Duration::from_secs(5),
            fast_sweep_interval: Duration::from_secs(5),
            periodic_sweep_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(1),
            delete_retries: 3,
        }
    }
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_replicated: u64,
    pub in_flight: usize,
    pub pending: usize,
    pub queued: usize,
}

/// Notifications for observers; each subscriber owns its receiver.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ItemAdded(QueueItem),
    ItemUpdated(QueueItem),
    ItemRemoved(u64),
    Completed {
        source_root: PathBuf,
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        source_root: PathBuf,
        path: PathBuf,
        error: String,
    },
}

/// Result of a forced full-tree sync.
#[derive(Debug, Clone, Default)]
pub struct ForceSyncReport {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub directories: u64,
    pub bytes_copied: u64,
    pub failures: Vec<(PathBuf, String)>,
}

impl ForceSyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Outcome {
    Replicated(u64),
    Skipped(&'static str),
}

struct Monitor {
    watcher: CacheWatcher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Background {
    scheduler: Scheduler,
    task: JoinHandle<()>,
}

struct Inner {
    copier: VerifiedCopyEngine,
    copy_options: CopyOptions,
    settings: SyncSettings,
    monitors: tokio::sync::Mutex<HashMap<PathBuf, Monitor>>,
    configs: RwLock<HashMap<PathBuf, SyncConfiguration>>,
    queue: Mutex<SyncQueue>,
    pending: Mutex<Vec<SyncOperation>>,
    /// Value is the dirty flag: another event arrived while running.
    in_flight: Mutex<HashMap<DedupKey, bool>>,
    path_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    copy_slots: Arc<Semaphore>,
    settling: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
    suppressed: Mutex<HashMap<PathBuf, Instant>>,
    stats: Mutex<SyncStats>,
    background: Mutex<Option<Background>>,
    /// Per source root; cancelled once monitoring of that root stops.
    roots: Mutex<HashMap<PathBuf, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Replicates cache changes back to the original directories.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(copier: VerifiedCopyEngine, copy_options: CopyOptions, settings: SyncSettings) -> Self {
        let slots = settings.max_concurrent_copies.max(1);
        Self {
            inner: Arc::new(Inner {
                copier,
                copy_options,
                settings,
                monitors: tokio::sync::Mutex::new(HashMap::new()),
                configs: RwLock::new(HashMap::new()),
                queue: Mutex::new(SyncQueue::new()),
                pending: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                path_locks: Mutex::new(HashMap::new()),
                copy_slots: Arc::new(Semaphore::new(slots)),
                settling: AtomicUsize::new(0),
                subscribers: Mutex::new(Vec::new()),
                suppressed: Mutex::new(HashMap::new()),
                stats: Mutex::new(SyncStats::default()),
                background: Mutex::new(None),
                roots: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Start the sweep timers. Idempotent.
    pub fn start(&self) {
        let mut background = self.inner.background.lock();
        if background.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let settings = &self.inner.settings;
        let (mut scheduler, mut ticks) = Scheduler::new(self.inner.shutdown.child_token());
        scheduler.every(TickKind::FastSweep, settings.fast_sweep_interval);
        scheduler.every(TickKind::PeriodicSweep, settings.periodic_sweep_interval);
        scheduler.every(TickKind::QueueCleanup, settings.cleanup_interval);

        let engine = self.clone();
        let cancel = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(tick) => {
                            engine.on_tick(tick);
                        }
                        None => break,
                    },
                }
            }
        });
        *background = Some(Background { scheduler, task });
    }

    /// Handle one scheduler tick. Returns how many items it touched.
    pub fn on_tick(&self, tick: Tick) -> usize {
        match tick.kind {
            TickKind::FastSweep => self.sweep_due(tick.at),
            TickKind::PeriodicSweep => self.sweep_periodic(),
            TickKind::QueueCleanup => self.purge_completed(tick.at),
            TickKind::HealthCheck => 0,
        }
    }

    /// Begin watching `config.cache_path`, replacing any existing watch.
    pub async fn start_monitoring(&self, config: SyncConfiguration) -> Result<()> {
        for dir in [&config.cache_path, &config.original_path] {
            if !dir.is_dir() {
                return Err(CacheError::NotADirectory { path: dir.clone() });
            }
        }

        let mut monitors = self.inner.monitors.lock().await;
        if let Some(old) = monitors.remove(&config.cache_path) {
            old.cancel.cancel();
        }

        let (watcher, rx) = CacheWatcher::new(&config.cache_path)?;
        let root = config.cache_path.clone();
        let root_cancel = {
            let mut roots = self.inner.roots.lock();
            let token = roots
                .entry(root.clone())
                .or_insert_with(|| self.inner.shutdown.child_token());
            if token.is_cancelled() {
                *token = self.inner.shutdown.child_token();
            }
            token.clone()
        };
        let cancel = root_cancel.child_token();
        self.inner
            .configs
            .write()
            .insert(root.clone(), config.clone());

        let task = tokio::spawn(self.clone().run_monitor(root.clone(), rx, cancel.clone()));
        monitors.insert(
            root,
            Monitor {
                watcher,
                cancel,
                task,
            },
        );
        drop(monitors);

        self.start();
        info!(
            "Monitoring {} -> {} ({:?}, delay {}s)",
            config.cache_path.display(),
            config.original_path.display(),
            config.mode,
            config.delay_seconds
        );
        Ok(())
    }

    /// Stop watching `cache_path` and discard its queued work.
    ///
    /// Operations already running for the root stop at their next wait, or
    /// finish their current copy; this returns only after they have left.
    /// Returns false if it was not being watched.
    pub async fn stop_monitoring(&self, cache_path: &Path) -> bool {
        let removed = self.inner.monitors.lock().await.remove(cache_path);
        self.inner.configs.write().remove(cache_path);
        self.inner
            .roots
            .lock()
            .entry(cache_path.to_path_buf())
            .or_insert_with(|| self.inner.shutdown.child_token())
            .cancel();
        self.inner
            .pending
            .lock()
            .retain(|op| op.source_root != cache_path);
        let dropped = self.inner.queue.lock().remove_root(cache_path);
        for id in dropped {
            self.emit(SyncEvent::ItemRemoved(id));
        }

        let watched = match removed {
            Some(monitor) => {
                monitor.cancel.cancel();
                let _ = monitor.task.await;
                true
            }
            None => false,
        };
        self.drain_root(cache_path).await;
        if watched {
            info!("Stopped monitoring {}", cache_path.display());
        }
        watched
    }

    /// Wait until no operation for `root` is in flight.
    async fn drain_root(&self, root: &Path) {
        loop {
            let busy = self
                .inner
                .in_flight
                .lock()
                .keys()
                .any(|(path, _)| path.starts_with(root));
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancellation scope of one source root.
    fn root_token(&self, root: &Path) -> CancellationToken {
        self.inner
            .roots
            .lock()
            .entry(root.to_path_buf())
            .or_insert_with(|| self.inner.shutdown.child_token())
            .clone()
    }

    pub async fn is_monitoring(&self, cache_path: &Path) -> bool {
        self.inner.monitors.lock().await.contains_key(cache_path)
    }

    pub async fn monitored(&self) -> Vec<PathBuf> {
        self.inner.monitors.lock().await.keys().cloned().collect()
    }

    pub fn configuration(&self, cache_path: &Path) -> Option<SyncConfiguration> {
        self.inner.configs.read().get(cache_path).cloned()
    }

    /// Feed an event into a monitor as if the OS had reported it.
    pub async fn inject_event(&self, cache_path: &Path, event: WatchEvent) -> bool {
        match self.inner.monitors.lock().await.get(cache_path) {
            Some(monitor) => monitor.watcher.sender().send(event).is_ok(),
            None => false,
        }
    }

    async fn run_monitor(
        self,
        root: PathBuf,
        mut rx: mpsc::UnboundedReceiver<WatchEvent>,
        cancel: CancellationToken,
    ) {
        let mut debouncer = EventDebouncer::new(self.inner.settings.debounce);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !debouncer.should_process(&event) {
                trace!("Debounced {:?} {}", event.kind, event.path.display());
                continue;
            }
            self.handle_event(&root, event, &cancel);
        }
        debug!("Watch loop for {} exited", root.display());
    }

    fn handle_event(&self, root: &Path, event: WatchEvent, cancel: &CancellationToken) {
        if is_temporary(&event.path) {
            trace!("Ignoring temporary file {}", event.path.display());
            return;
        }
        let Some(config) = self.configuration(root) else {
            return;
        };
        if !config.enabled || event.path == config.cache_path {
            return;
        }

        let operation = SyncOperation::new(&config, event.kind, &event.path)
            .with_from(event.from.clone())
            .with_is_dir(event.is_dir);

        let needs_settle = matches!(event.kind, ChangeKind::Created | ChangeKind::Changed)
            && !operation.is_dir;
        if !needs_settle {
            self.submit(operation);
            return;
        }

        let engine = self.clone();
        let cancel = cancel.clone();
        self.inner.settling.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let settings = &engine.inner.settings;
            let state = wait_for_write_complete(
                &operation.path,
                settings.write_settle,
                settings.write_checks,
                &cancel,
            )
            .await;
            match state {
                WriteState::Vanished => {
                    debug!("{} vanished before it settled", operation.path.display())
                }
                WriteState::Complete if !cancel.is_cancelled() => {
                    let config = engine.configuration(&operation.source_root);
                    if let Some(config) = config {
                        let fresh = SyncOperation::new(&config, operation.kind, &operation.path)
                            .with_from(operation.from.clone())
                            .refreshed()
                            .await;
                        engine.submit(fresh);
                    }
                }
                WriteState::Complete => {}
            }
            engine.inner.settling.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Route an operation by its mode.
    pub fn submit(&self, operation: SyncOperation) {
        match operation.mode {
            SyncMode::Immediate => self.dispatch(operation),
            SyncMode::Periodic => self.defer(operation),
        }
    }

    fn defer(&self, mut operation: SyncOperation) {
        let mut pending = self.inner.pending.lock();

        // a delete and a later create of one path cancel out; whatever came
        // last decides, and the oldest timestamp keeps the delay bound
        let mut earliest = operation.queued_at;
        pending.retain(|p| {
            if p.path == operation.path && supersedes(operation.kind, p.kind) {
                earliest = earliest.min(p.queued_at);
                false
            } else {
                true
            }
        });
        operation.queued_at = earliest;

        let key = operation.key();
        if let Some(existing) = pending.iter_mut().find(|p| p.key() == key) {
            // keep the original timestamp so the delay bound holds
            existing.size = operation.size;
            existing.is_dir = operation.is_dir;
            if operation.from.is_some() {
                existing.from = operation.from;
            }
            return;
        }
        debug!("Deferred {:?} {}", operation.kind, operation.path.display());
        pending.push(operation);
    }

    /// Start processing an operation unless the same key is already running.
    pub fn dispatch(&self, operation: SyncOperation) {
        let key = operation.key();
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(dirty) = in_flight.get_mut(&key) {
                *dirty = true;
                trace!("{} already in flight", operation.path.display());
                return;
            }
            in_flight.insert(key, false);
        }

        let item = self.inner.queue.lock().push(operation.clone(), Utc::now());
        let id = item.id;
        self.emit(SyncEvent::ItemAdded(item));

        let engine = self.clone();
        tokio::spawn(async move { engine.run_item(id, operation).await });
    }

    async fn run_item(self, id: u64, operation: SyncOperation) {
        let cancel = self.root_token(&operation.source_root);
        let path_lock = self.path_lock(&operation.path);
        let guard = path_lock.lock().await;

        if let Some(item) = self.inner.queue.lock().start(id) {
            self.emit(SyncEvent::ItemUpdated(item));
        }

        let result = if cancel.is_cancelled() {
            Ok(Outcome::Skipped("monitoring stopped"))
        } else {
            self.execute(id, &operation, &cancel).await
        };
        let now = Utc::now();
        match result {
            Ok(outcome) => {
                let bytes = match outcome {
                    Outcome::Replicated(bytes) => {
                        let mut stats = self.inner.stats.lock();
                        stats.completed += 1;
                        stats.bytes_replicated += bytes;
                        bytes
                    }
                    Outcome::Skipped(reason) => {
                        debug!("Skipped {}: {}", operation.path.display(), reason);
                        self.inner.stats.lock().skipped += 1;
                        0
                    }
                };
                if let Some(item) = self.inner.queue.lock().complete(id, now) {
                    self.emit(SyncEvent::ItemUpdated(item));
                }
                self.emit(SyncEvent::Completed {
                    source_root: operation.source_root.clone(),
                    path: operation.path.clone(),
                    bytes,
                });
            }
            Err(e) => {
                warn!(
                    "Sync of {} ({:?}) failed: {}",
                    operation.path.display(),
                    operation.kind,
                    e
                );
                self.inner.stats.lock().failed += 1;
                if let Some(item) = self.inner.queue.lock().fail(id, e.to_string(), now) {
                    self.emit(SyncEvent::ItemUpdated(item));
                }
                self.emit(SyncEvent::Failed {
                    source_root: operation.source_root.clone(),
                    path: operation.path.clone(),
                    error: e.to_string(),
                });
            }
        }

        drop(guard);
        drop(path_lock);
        self.release_path_lock(&operation.path);

        // held as settling until the rerun is submitted, so wait_idle sees no gap
        self.inner.settling.fetch_add(1, Ordering::SeqCst);
        let rerun = self
            .inner
            .in_flight
            .lock()
            .remove(&operation.key())
            .unwrap_or(false);
        if rerun && !cancel.is_cancelled() {
            if let Some(config) = self.configuration(&operation.source_root) {
                let fresh = SyncOperation::new(&config, operation.kind, &operation.path)
                    .with_from(operation.from.clone())
                    .refreshed()
                    .await;
                self.submit(fresh);
            }
        }
        self.inner.settling.fetch_sub(1, Ordering::SeqCst);
    }

    async fn execute(
        &self,
        id: u64,
        operation: &SyncOperation,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let target = operation
            .relative()
            .filter(|r| !r.as_os_str().is_empty())
            .map(|r| operation.target_root.join(r))
            .ok_or_else(|| {
                CacheError::internal(format!(
                    "{} is not inside {}",
                    operation.path.display(),
                    operation.source_root.display()
                ))
            })?;

        match operation.kind {
            ChangeKind::Created | ChangeKind::Changed => {
                self.replicate(id, &operation.path, &target, cancel).await
            }
            ChangeKind::Deleted => self.remove_target(&operation.path, &target, cancel).await,
            ChangeKind::Renamed => self.rename_target(id, operation, &target, cancel).await,
        }
    }

    async fn replicate(
        &self,
        id: u64,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let metadata = match tokio::fs::metadata(source).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Outcome::Skipped("source vanished"))
            }
            Err(e) => return Err(CacheError::io(e, "reading metadata", source)),
        };

        if metadata.is_dir() {
            // children created before the watch caught up are picked up here
            let report = self.mirror(source, target, &Progress::silent()).await?;
            if let Some((path, error)) = report.failures.into_iter().next() {
                return Err(CacheError::internal(format!(
                    "mirroring {}: {}: {}",
                    source.display(),
                    path.display(),
                    error
                )));
            }
            return Ok(Outcome::Replicated(report.bytes_copied));
        }

        let lock = acquire_read_lock(source, &self.inner.settings.lock_backoff, cancel).await;
        if cancel.is_cancelled() {
            return Ok(Outcome::Skipped("monitoring stopped"));
        }
        let _lock = match lock {
            Ok(lock) => lock,
            Err(CacheError::NotFound { .. }) => return Ok(Outcome::Skipped("source vanished")),
            Err(e) => return Err(e),
        };
        let _permit = self
            .inner
            .copy_slots
            .acquire()
            .await
            .map_err(|e| CacheError::internal(e.to_string()))?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Skipped("monitoring stopped"));
        }

        let engine = self.clone();
        let on_bytes: ByteProgress =
            Arc::new(move |done, total| engine.update_progress(id, percent(done, total)));
        let outcome = self
            .inner
            .copier
            .copy_with(
                source,
                target,
                &self.inner.copy_options,
                &Progress::silent(),
                Some(on_bytes),
            )
            .await;
        let outcome = outcome.into_result()?;
        Ok(Outcome::Replicated(outcome.bytes_copied))
    }

    async fn remove_target(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if self.is_suppressed(source) {
            return Ok(Outcome::Skipped("deletion suppressed"));
        }
        // recreated since the delete was reported
        if tokio::fs::symlink_metadata(source).await.is_ok() {
            return Ok(Outcome::Skipped("source present"));
        }
        self.delete_target(target, cancel).await
    }

    async fn delete_target(&self, target: &Path, cancel: &CancellationToken) -> Result<Outcome> {
        let retries = self.inner.settings.delete_retries;
        let mut attempt = 0;
        loop {
            let result = match tokio::fs::symlink_metadata(target).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Outcome::Skipped("already absent"))
                }
                Err(e) => Err(e),
                Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(target).await,
                Ok(_) => tokio::fs::remove_file(target).await,
            };
            match result {
                Ok(()) => return Ok(Outcome::Replicated(0)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Outcome::Skipped("already absent"))
                }
                Err(e) if attempt < retries => {
                    let delay = self.inner.settings.lock_backoff.delay(attempt);
                    debug!("Delete of {} failed ({}), retrying in {:?}", target.display(), e, delay);
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CacheError::io(e, "deleting", target))
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(CacheError::io(e, "deleting", target)),
            }
        }
    }

    async fn rename_target(
        &self,
        id: u64,
        operation: &SyncOperation,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let Some(from_target) = operation.from_target() else {
            return self.replicate(id, &operation.path, target, cancel).await;
        };
        if tokio::fs::symlink_metadata(&from_target).await.is_err() {
            return self.replicate(id, &operation.path, target, cancel).await;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io(e, "creating directory", parent))?;
        }
        match tokio::fs::rename(&from_target, target).await {
            Ok(()) => return Ok(Outcome::Replicated(0)),
            Err(e) => debug!(
                "Rename {} -> {} failed ({}), copying instead",
                from_target.display(),
                target.display(),
                e
            ),
        }

        let outcome = self.replicate(id, &operation.path, target, cancel).await?;
        if let Err(e) = self.delete_target(&from_target, cancel).await {
            warn!(
                "Copied {} but the old name {} is still in the original: {}",
                target.display(),
                from_target.display(),
                e
            );
            return Err(e);
        }
        Ok(outcome)
    }

    fn update_progress(&self, id: u64, progress: f64) {
        let item = self.inner.queue.lock().set_progress(id, progress);
        if let Some(item) = item {
            self.emit(SyncEvent::ItemUpdated(item));
        }
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .path_locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn release_path_lock(&self, path: &Path) {
        let mut locks = self.inner.path_locks.lock();
        if locks.get(path).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(path);
        }
    }

    /// Dispatch pending operations whose delay has elapsed.
    pub fn sweep_due(&self, now: chrono::DateTime<Utc>) -> usize {
        let due: Vec<SyncOperation> = {
            let mut pending = self.inner.pending.lock();
            let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|op| op.is_due(now));
            *pending = waiting;
            due
        };
        let count = due.len();
        for operation in due {
            self.dispatch(operation);
        }
        count
    }

    /// Dispatch everything waiting in the periodic queue.
    pub fn sweep_periodic(&self) -> usize {
        let all: Vec<SyncOperation> = self.inner.pending.lock().drain(..).collect();
        let count = all.len();
        if count > 0 {
            debug!("Periodic sweep dispatching {} operations", count);
        }
        for operation in all {
            self.dispatch(operation);
        }
        count
    }

    /// Drop Done items past their retention and expired delete suppressions.
    pub fn purge_completed(&self, now: chrono::DateTime<Utc>) -> usize {
        let removed = self
            .inner
            .queue
            .lock()
            .purge_done(now, self.inner.settings.done_retention);
        let count = removed.len();
        for id in removed {
            self.emit(SyncEvent::ItemRemoved(id));
        }
        let instant = Instant::now();
        self.inner
            .suppressed
            .lock()
            .retain(|_, until| *until > instant);
        count
    }

    /// Mirror every file and directory under `cache` into `original`,
    /// whether or not it is being watched.
    pub async fn force_sync(
        &self,
        cache: &Path,
        original: &Path,
        progress: &Progress,
    ) -> Result<ForceSyncReport> {
        info!("Force sync {} -> {}", cache.display(), original.display());
        let report = self.mirror(cache, original, progress).await?;
        info!(
            "Force sync finished: {} copied, {} unchanged, {} failed",
            report.files_copied,
            report.files_skipped,
            report.failures.len()
        );
        Ok(report)
    }

    async fn mirror(&self, source: &Path, target: &Path, progress: &Progress) -> Result<ForceSyncReport> {
        if !source.is_dir() {
            return Err(CacheError::NotADirectory {
                path: source.to_path_buf(),
            });
        }
        let listing = {
            let root = source.to_path_buf();
            tokio::task::spawn_blocking(move || tree::walk(&root)).await??
        };

        let mut report = ForceSyncReport::default();
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| CacheError::io(e, "creating directory", target))?;
        for dir in &listing.directories {
            let path = target.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| CacheError::io(e, "creating directory", &path))?;
            report.directories += 1;
        }

        let to_copy: Vec<TreeFile> = listing
            .files
            .into_iter()
            .filter(|f| !is_temporary(&f.path))
            .filter(|f| {
                let unchanged = is_unchanged(f, &target.join(&f.relative));
                if unchanged {
                    report.files_skipped += 1;
                }
                !unchanged
            })
            .collect();

        let total = to_copy.len();
        if total > 0 {
            progress.report(format!(
                "Syncing {} files ({}) to {}",
                total,
                format_size(to_copy.iter().map(|f| f.size).sum::<u64>(), BINARY),
                target.display()
            ));
        }

        let mut tasks = JoinSet::new();
        for file in to_copy {
            let permit = self
                .inner
                .copy_slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CacheError::internal(e.to_string()))?;
            let copier = self.inner.copier.clone();
            let options = self.inner.copy_options.clone();
            let destination = target.join(&file.relative);
            tasks.spawn(async move {
                let outcome = copier
                    .copy_with(&file.path, &destination, &options, &Progress::silent(), None)
                    .await;
                drop(permit);
                (file.relative, outcome)
            });
        }

        let mut finished = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (relative, outcome) = joined?;
            finished += 1;
            if outcome.success {
                report.files_copied += 1;
                report.bytes_copied += outcome.bytes_copied;
                progress.report(format!("[{}/{}] {}", finished, total, relative.display()));
            } else {
                let error = outcome.error.unwrap_or_else(|| "copy failed".into());
                progress.report(format!("Failed {}: {}", relative.display(), error));
                report.failures.push((relative, error));
            }
        }
        Ok(report)
    }

    /// Do not replicate deletion of these cache paths for `ttl`.
    pub fn suppress_deletes(&self, paths: impl IntoIterator<Item = PathBuf>, ttl: Duration) {
        let until = Instant::now() + ttl;
        let mut suppressed = self.inner.suppressed.lock();
        for path in paths {
            suppressed.insert(path, until);
        }
    }

    fn is_suppressed(&self, path: &Path) -> bool {
        self.inner
            .suppressed
            .lock()
            .get(path)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    /// Snapshot of every visible queue item.
    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.inner.queue.lock().snapshot()
    }

    /// Run every failed item again. Returns how many were resubmitted.
    pub fn retry_failed(&self) -> usize {
        let failed = self.inner.queue.lock().take_failed();
        let count = failed.len();
        for item in failed {
            self.emit(SyncEvent::ItemRemoved(item.id));
            let mut operation = item.operation;
            operation.queued_at = Utc::now();
            self.dispatch(operation);
        }
        count
    }

    pub fn clear_completed(&self) -> usize {
        self.clear(QueueStatus::Done)
    }

    pub fn clear_failed(&self) -> usize {
        self.clear(QueueStatus::Failed)
    }

    fn clear(&self, status: QueueStatus) -> usize {
        let removed = self.inner.queue.lock().remove_status(status);
        let count = removed.len();
        for id in removed {
            self.emit(SyncEvent::ItemRemoved(id));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Queued plus unfinished work for one root, and the oldest timestamp.
    pub fn backlog(&self, source_root: &Path) -> (usize, Option<chrono::DateTime<Utc>>) {
        let mut stamps: Vec<_> = self
            .inner
            .pending
            .lock()
            .iter()
            .filter(|op| op.source_root == source_root)
            .map(|op| op.queued_at)
            .collect();
        stamps.extend(
            self.inner
                .queue
                .lock()
                .snapshot()
                .into_iter()
                .filter(|item| item.operation.source_root == source_root)
                .filter(|item| matches!(item.status, QueueStatus::Waiting | QueueStatus::Processing))
                .map(|item| item.created_at),
        );
        (stamps.len(), stamps.into_iter().min())
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.in_flight = self.inner.in_flight.lock().len();
        stats.pending = self.pending_count();
        stats.queued = self.inner.queue.lock().len();
        stats
    }

    /// Receive every [`SyncEvent`] from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: SyncEvent) {
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Wait until nothing is settling or in flight. False on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self.inner.settling.load(Ordering::SeqCst) > 0
                || !self.inner.in_flight.lock().is_empty();
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop every watcher and timer. Running copies finish on their own.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let monitors: Vec<Monitor> = self.inner.monitors.lock().await.drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.cancel.cancel();
            let _ = monitor.task.await;
        }
        self.inner.configs.write().clear();
        let background = self.inner.background.lock().take();
        if let Some(mut background) = background {
            background.scheduler.shutdown();
            background.task.abort();
        }
        info!("Sync engine stopped");
    }
}

/// Whether a pending `older` operation on the same path is made obsolete by `newer`.
fn supersedes(newer: ChangeKind, older: ChangeKind) -> bool {
    use ChangeKind::*;
    matches!(
        (newer, older),
        (Deleted, Created | Changed) | (Created | Changed, Deleted)
    )
}

fn is_unchanged(file: &TreeFile, target: &Path) -> bool {
    let Ok(existing) = std::fs::metadata(target) else {
        return false;
    };
    if !existing.is_file() || existing.len() != file.size {
        return false;
    }
    match (file.modified, existing.modified().ok()) {
        (Some(a), Some(b)) => {
            let distance = a.duration_since(b).or_else(|_| b.duration_since(a));
            distance.map(|d| d <= DATE_TOLERANCE).unwrap_or(false)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            debounce: Duration::from_millis(200),
            write_settle: Duration::from_millis(20),
            write_checks: 3,
            lock_backoff: Backoff {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
                max_attempts: 3,
            },
            done_retention: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(
            VerifiedCopyEngine::default(),
            CopyOptions::default(),
            fast_settings(),
        )
    }

    fn config(dir: &Path) -> SyncConfiguration {
        let cache = dir.join("cache");
        let original = dir.join("original");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::create_dir_all(&original).unwrap();
        SyncConfiguration::new(cache, original)
    }

    #[tokio::test]
    async fn test_dispatch_copies_file() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        let file = config.cache_path.join("a.txt");
        std::fs::write(&file, b"alpha").unwrap();

        engine.dispatch(SyncOperation::new(&config, ChangeKind::Created, &file));
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert_eq!(std::fs::read(config.original_path.join("a.txt")).unwrap(), b"alpha");
        let items = engine.queue_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Done);
        assert_eq!(engine.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_delete_and_suppression() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        std::fs::write(config.original_path.join("gone.txt"), b"x").unwrap();
        std::fs::write(config.original_path.join("kept.txt"), b"x").unwrap();

        let kept = config.cache_path.join("kept.txt");
        engine.suppress_deletes([kept.clone()], Duration::from_secs(60));
        engine.dispatch(SyncOperation::new(
            &config,
            ChangeKind::Deleted,
            config.cache_path.join("gone.txt"),
        ));
        engine.dispatch(SyncOperation::new(&config, ChangeKind::Deleted, &kept));
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert!(!config.original_path.join("gone.txt").exists());
        assert!(config.original_path.join("kept.txt").exists());
    }

    #[tokio::test]
    async fn test_rename_moves_target() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        std::fs::write(config.original_path.join("old.txt"), b"same").unwrap();
        std::fs::write(config.cache_path.join("new.txt"), b"same").unwrap();

        let op = SyncOperation::new(&config, ChangeKind::Renamed, config.cache_path.join("new.txt"))
            .with_from(Some(config.cache_path.join("old.txt")));
        engine.dispatch(op);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert!(!config.original_path.join("old.txt").exists());
        assert_eq!(std::fs::read(config.original_path.join("new.txt")).unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_periodic_operations_wait_for_sweep() {
        let dir = tempdir().unwrap();
        let config = config(dir.path()).with_mode(SyncMode::Periodic, 3);
        let engine = engine();
        let file = config.cache_path.join("p.txt");
        std::fs::write(&file, b"later").unwrap();

        let op = SyncOperation::new(&config, ChangeKind::Changed, &file);
        let queued = op.queued_at;
        engine.submit(op.clone());
        engine.submit(op);
        assert_eq!(engine.pending_count(), 1);

        // fast sweep before the delay does nothing
        assert_eq!(engine.sweep_due(queued + chrono::Duration::seconds(1)), 0);
        assert_eq!(engine.pending_count(), 1);

        // once due it is dispatched
        assert_eq!(engine.sweep_due(queued + chrono::Duration::seconds(3)), 1);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(std::fs::read(config.original_path.join("p.txt")).unwrap(), b"later");
    }

    #[tokio::test]
    async fn test_failed_items_can_be_retried() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        let outside = SyncOperation {
            source_root: config.cache_path.join("elsewhere"),
            ..SyncOperation::new(&config, ChangeKind::Created, config.cache_path.join("x"))
        };
        engine.dispatch(outside);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(engine.queue_items()[0].status, QueueStatus::Failed);
        assert_eq!(engine.stats().failed, 1);

        assert_eq!(engine.retry_failed(), 1);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(engine.clear_failed(), 1);
        assert!(engine.queue_items().is_empty());
    }

    #[tokio::test]
    async fn test_force_sync_skips_unchanged() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        std::fs::create_dir_all(config.cache_path.join("sub")).unwrap();
        std::fs::write(config.cache_path.join("sub/one.txt"), b"1").unwrap();
        std::fs::write(config.cache_path.join("two.txt"), b"22").unwrap();
        std::fs::write(config.cache_path.join("~$lock.docx"), b"tmp").unwrap();

        let first = engine
            .force_sync(&config.cache_path, &config.original_path, &Progress::silent())
            .await
            .unwrap();
        assert_eq!(first.files_copied, 2);
        assert!(first.is_complete());
        assert!(!config.original_path.join("~$lock.docx").exists());

        let second = engine
            .force_sync(&config.cache_path, &config.original_path, &Progress::silent())
            .await
            .unwrap();
        assert_eq!(second.files_copied, 0);
        assert_eq!(second.files_skipped, 2);
    }

    #[tokio::test]
    async fn test_delete_skipped_while_source_present() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        let file = config.cache_path.join("back.txt");
        std::fs::write(&file, b"recreated").unwrap();
        std::fs::write(config.original_path.join("back.txt"), b"recreated").unwrap();

        engine.dispatch(SyncOperation::new(&config, ChangeKind::Deleted, &file));
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert!(config.original_path.join("back.txt").exists());
        assert_eq!(engine.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_rename_fallback_removes_old_name() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        // renaming a directory over a file fails, which forces the copy path
        std::fs::create_dir_all(config.original_path.join("old.txt")).unwrap();
        std::fs::write(config.original_path.join("old.txt/inner"), b"i").unwrap();
        std::fs::write(config.original_path.join("new.txt"), b"stale").unwrap();
        std::fs::write(config.cache_path.join("new.txt"), b"fresh").unwrap();

        let op = SyncOperation::new(&config, ChangeKind::Renamed, config.cache_path.join("new.txt"))
            .with_from(Some(config.cache_path.join("old.txt")));
        engine.dispatch(op);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert_eq!(std::fs::read(config.original_path.join("new.txt")).unwrap(), b"fresh");
        assert!(!config.original_path.join("old.txt").exists());
        assert_eq!(engine.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_dirty_key_runs_once_more() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        let file = config.cache_path.join("busy.txt");
        std::fs::write(&file, b"v1").unwrap();
        engine.start_monitoring(config.clone()).await.unwrap();

        let op = SyncOperation::new(&config, ChangeKind::Changed, &file);
        engine.dispatch(op.clone());
        engine.dispatch(op.clone());
        engine.dispatch(op);
        assert!(engine.wait_idle(Duration::from_secs(10)).await);

        assert_eq!(engine.stats().completed, 2);
        assert_eq!(std::fs::read(config.original_path.join("busy.txt")).unwrap(), b"v1");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_monitoring_cancels_root() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        engine.start_monitoring(config.clone()).await.unwrap();
        assert!(engine.stop_monitoring(&config.cache_path).await);

        let file = config.cache_path.join("late.txt");
        std::fs::write(&file, b"late").unwrap();
        engine.dispatch(SyncOperation::new(&config, ChangeKind::Created, &file));
        assert!(engine.wait_idle(Duration::from_secs(10)).await);
        assert!(!config.original_path.join("late.txt").exists());
        assert_eq!(engine.stats().skipped, 1);

        // watching again opens a fresh scope
        engine.start_monitoring(config.clone()).await.unwrap();
        engine.dispatch(SyncOperation::new(&config, ChangeKind::Created, &file));
        assert!(engine.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(std::fs::read(config.original_path.join("late.txt")).unwrap(), b"late");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_monitoring_drains_in_flight() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let engine = engine();
        let file = config.cache_path.join("big.bin");
        std::fs::write(&file, vec![7u8; 8 * 1024 * 1024]).unwrap();
        engine.start_monitoring(config.clone()).await.unwrap();

        engine.dispatch(SyncOperation::new(&config, ChangeKind::Created, &file));
        assert!(engine.stop_monitoring(&config.cache_path).await);

        // nothing for the root may still be writing once stop returns
        assert_eq!(engine.stats().in_flight, 0);
        let copied = config.original_path.join("big.bin");
        let len = std::fs::metadata(&copied).map(|m| m.len()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(std::fs::metadata(&copied).map(|m| m.len()).unwrap_or(0), len);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_monitoring_requires_directories() {
        let dir = tempdir().unwrap();
        let engine = engine();
        let config = SyncConfiguration::new(dir.path().join("missing"), dir.path());
        assert!(engine.start_monitoring(config).await.is_err());
        engine.shutdown().await;
    }
}
