//! Cache manager: the outward-facing orchestrator.
//!
//! Sequences the verified copy engine, the reparse manager and the sync engine
//! through each mount's lifecycle, and feeds outcomes to the recovery
//! supervisor. Multi-step operations undo completed steps on failure.

pub mod cleanup;
pub mod layout;
pub mod lifecycle;

pub use cleanup::{CacheStats, CleanupReport};
pub use layout::{cache_path_for, drive_label, original_path_for};
pub use lifecycle::LifecycleState;

use crate::config::{AcceleratedMount, ConfigStore, SyncDefaults};
use crate::copy::{CopyOptions, VerifiedCopyEngine};
use crate::error::{CacheError, Result};
use crate::fs::tree;
use crate::progress::Progress;
use crate::recovery::{
    HealthReport, RecoveryActions, RecoveryOutcome, RecoveryRequest, RecoverySettings,
    RecoverySupervisor, Severity,
};
use crate::reparse::{self, RedirectionStatus, ReparseManager};
use crate::sync::{
    is_temporary, ForceSyncReport, SyncConfiguration, SyncEngine, SyncEvent, SyncSettings,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything the manager needs to build its engines.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub copy: CopyOptions,
    pub sync: SyncSettings,
    pub sync_defaults: SyncDefaults,
    pub recovery: RecoverySettings,
    /// Files copied at once when populating a cache.
    pub copy_concurrency: usize,
    /// How long evicted cache paths ignore delete events.
    pub eviction_suppression: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            copy: CopyOptions::default(),
            sync: SyncSettings::default(),
            sync_defaults: SyncDefaults::default(),
            recovery: RecoverySettings::default(),
            copy_concurrency: 4,
            eviction_suppression: Duration::from_secs(60),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        let mut settings = Self::default();
        settings.copy.verification = config.verification;
        settings.copy.huge_file_strategy = config.huge_file_strategy;
        settings.sync.debounce = Duration::from_millis(config.sync.debounce_ms);
        settings.sync.max_concurrent_copies = config.sync.max_concurrent_copies.max(1);
        settings.sync_defaults = config.sync.clone();
        settings
    }
}

/// Result of [`CacheManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub mount_point: PathBuf,
    pub redirection: RedirectionStatus,
    pub original_exists: bool,
    pub cache_exists: bool,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.redirection.is_valid() && self.original_exists && self.cache_exists
    }

    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match &self.redirection {
            RedirectionStatus::Valid => {}
            RedirectionStatus::NotARedirection => issues.push("mount point is not a redirection".into()),
            RedirectionStatus::Unreadable => issues.push("redirection target unreadable".into()),
            RedirectionStatus::TargetMissing(t) => {
                issues.push(format!("redirection target missing: {}", t.display()))
            }
            RedirectionStatus::Mismatch(t) => {
                issues.push(format!("redirection points to {}", t.display()))
            }
        }
        if !self.original_exists {
            issues.push("original directory missing".into());
        }
        if !self.cache_exists {
            issues.push("cache directory missing".into());
        }
        issues
    }
}

/// Completed accelerate steps, undone in reverse on failure.
#[derive(Debug)]
enum Step {
    CachePopulated { created: bool },
    SourceParked,
    Redirected,
    Monitoring,
}

struct Inner {
    reparse: ReparseManager,
    copier: VerifiedCopyEngine,
    sync: SyncEngine,
    supervisor: RecoverySupervisor,
    settings: ManagerSettings,
    lifecycle: Mutex<HashMap<String, LifecycleState>>,
    mounts: Mutex<HashMap<String, AcceleratedMount>>,
    store: Option<Mutex<ConfigStore>>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<RecoveryRequest>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Orchestrates acceleration of folders. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl CacheManager {
    /// Build a manager. With a store, mount records are persisted.
    pub fn new(settings: ManagerSettings, store: Option<ConfigStore>) -> Self {
        let copier = VerifiedCopyEngine::new(settings.copy.clone());
        let sync = SyncEngine::new(copier.clone(), settings.copy.clone(), settings.sync.clone());
        let (supervisor, requests) = RecoverySupervisor::new(settings.recovery.clone());
        Self {
            inner: Arc::new(Inner {
                reparse: ReparseManager::new(),
                copier,
                sync,
                supervisor,
                settings,
                lifecycle: Mutex::new(HashMap::new()),
                mounts: Mutex::new(HashMap::new()),
                store: store.map(Mutex::new),
                requests: Mutex::new(Some(requests)),
                background: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub fn supervisor(&self) -> &RecoverySupervisor {
        &self.inner.supervisor
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Current lifecycle state of `mount`.
    pub fn lifecycle(&self, mount: &Path) -> LifecycleState {
        self.inner
            .lifecycle
            .lock()
            .get(&reparse::normalize(mount))
            .copied()
            .unwrap_or_default()
    }

    fn set_lifecycle(&self, mount: &Path, next: LifecycleState) {
        let mut table = self.inner.lifecycle.lock();
        let key = reparse::normalize(mount);
        let current = table.get(&key).copied().unwrap_or_default();
        if current == next {
            return;
        }
        if !current.can_become(next) {
            debug!("Lifecycle of {} jumps {} -> {}", mount.display(), current, next);
        }
        if next == LifecycleState::Unaccelerated {
            table.remove(&key);
        } else {
            table.insert(key, next);
        }
        info!("{}: {} -> {}", mount.display(), current, next);
    }

    /// Known mount records.
    pub fn mounts(&self) -> Vec<AcceleratedMount> {
        self.inner.mounts.lock().values().cloned().collect()
    }

    pub fn mount(&self, mount_point: &Path) -> Option<AcceleratedMount> {
        self.inner
            .mounts
            .lock()
            .get(&reparse::normalize(mount_point))
            .cloned()
    }

    fn mount_for_cache(&self, cache: &Path) -> Option<AcceleratedMount> {
        self.inner
            .mounts
            .lock()
            .values()
            .find(|m| reparse::paths_equal(&m.cache_path, cache))
            .cloned()
    }

    /// Another folder that has a claim on `cache`, if any.
    ///
    /// A directory left behind without a record counts as claimed unless
    /// every entry in it also exists in `source`.
    fn claimant(&self, cache: &Path, source: &Path) -> Option<PathBuf> {
        if let Some(owner) = self.mount_for_cache(cache) {
            if !reparse::paths_equal(&owner.mount_point, source) {
                return Some(owner.mount_point);
            }
        }
        if let Some(config) = self.inner.sync.configuration(cache) {
            if !reparse::paths_equal(&config.original_path, &original_path_for(source)) {
                return Some(config.original_path);
            }
        }
        let entries = std::fs::read_dir(cache).ok()?;
        let foreign = entries.flatten().map(|e| e.path()).find(|path| {
            !is_temporary(path)
                && path
                    .file_name()
                    .map(|name| source.join(name).symlink_metadata().is_err())
                    .unwrap_or(false)
        });
        foreign.map(|_| cache.to_path_buf())
    }

    /// Record the current size of a mount, in memory and in the store.
    fn note_size(&self, mount_point: &Path, size_bytes: u64) {
        if let Some(mount) = self
            .inner
            .mounts
            .lock()
            .get_mut(&reparse::normalize(mount_point))
        {
            mount.size_bytes = size_bytes;
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.lock().update_size(mount_point, size_bytes) {
                warn!("Failed to persist size of {}: {}", mount_point.display(), e);
            }
        }
    }

    fn remember(&self, mount: AcceleratedMount) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.lock().add_mount(mount.clone()) {
                warn!("Failed to persist {}: {}", mount.mount_point.display(), e);
            }
        }
        self.inner
            .mounts
            .lock()
            .insert(reparse::normalize(&mount.mount_point), mount);
    }

    fn forget(&self, mount_point: &Path) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.lock().remove_mount(mount_point) {
                warn!("Failed to persist removal of {}: {}", mount_point.display(), e);
            }
        }
        self.inner.mounts.lock().remove(&reparse::normalize(mount_point));
    }

    fn sync_config(&self, cache: &Path, original: &Path) -> SyncConfiguration {
        let defaults = &self.inner.settings.sync_defaults;
        SyncConfiguration::new(cache, original).with_mode(defaults.mode, defaults.delay_seconds)
    }

    /// Accelerate `source` into `<cache_root>/<drive>/<name>`.
    pub async fn accelerate(
        &self,
        source: &Path,
        cache_root: &Path,
        progress: &Progress,
    ) -> Result<AcceleratedMount> {
        let source = layout::clean(&reparse::absolute(source));
        let cache_root = reparse::absolute(cache_root);

        if self.inner.reparse.is_redirection(&source) {
            return Err(CacheError::AlreadyAccelerated { path: source });
        }
        let state = self.lifecycle(&source);
        if state != LifecycleState::Unaccelerated {
            return Err(CacheError::Busy {
                path: source,
                state: state.to_string(),
            });
        }
        for dir in [&source, &cache_root] {
            if !dir.exists() {
                return Err(CacheError::NotFound { path: dir.clone() });
            }
            if !dir.is_dir() {
                return Err(CacheError::NotADirectory { path: dir.clone() });
            }
        }
        let cache = cache_path_for(&cache_root, &source)?;
        let original = original_path_for(&source);
        if original.symlink_metadata().is_ok() {
            return Err(CacheError::AlreadyExists { path: original });
        }
        if let Some(owner) = self.claimant(&cache, &source) {
            warn!(
                "{} is already the cache of {}",
                cache.display(),
                owner.display()
            );
            return Err(CacheError::AlreadyExists { path: cache });
        }

        self.set_lifecycle(&source, LifecycleState::Initializing);
        info!(
            "Accelerating {} via {}",
            source.display(),
            cache.display()
        );
        progress.report(format!("Accelerating {}", source.display()));

        let mut steps = Vec::new();
        match self
            .run_accelerate(&source, &original, &cache, &mut steps, progress)
            .await
        {
            Ok(size_bytes) => {
                let mount = AcceleratedMount {
                    mount_point: source.clone(),
                    original_path: original.clone(),
                    cache_path: cache.clone(),
                    created_at: Utc::now(),
                    size_bytes,
                };
                self.inner.supervisor.record_state(&source, &original, &cache);
                self.remember(mount.clone());
                self.set_lifecycle(&source, LifecycleState::Accelerated);
                progress.report(format!("{} is accelerated", source.display()));
                Ok(mount)
            }
            Err(cause) => {
                error!("Accelerating {} failed: {}", source.display(), cause);
                progress.report(format!("Acceleration failed: {cause}"));
                let rollback = self
                    .rollback(&source, &original, &cache, steps, progress)
                    .await;
                self.set_lifecycle(&source, LifecycleState::Unaccelerated);
                if rollback.is_empty() {
                    Err(cause)
                } else {
                    Err(CacheError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback,
                    })
                }
            }
        }
    }

    async fn run_accelerate(
        &self,
        source: &Path,
        original: &Path,
        cache: &Path,
        steps: &mut Vec<Step>,
        progress: &Progress,
    ) -> Result<u64> {
        let created = !cache.exists();
        steps.push(Step::CachePopulated { created });
        progress.report(format!("Copying {} -> {}", source.display(), cache.display()));
        let report = self
            .inner
            .copier
            .copy_tree(
                source,
                cache,
                &self.inner.settings.copy,
                self.inner.settings.copy_concurrency,
                progress,
            )
            .await?;
        if let Some((path, reason)) = report.failures.first() {
            return Err(CacheError::VerificationFailed {
                path: source.join(path),
                reason: format!("{} of the files failed to copy: {}", report.failures.len(), reason),
            });
        }

        progress.report(format!("Parking original at {}", original.display()));
        tokio::fs::rename(source, original)
            .await
            .map_err(|e| CacheError::io(e, "renaming source", source))?;
        steps.push(Step::SourceParked);
        if let Err(e) = self.inner.reparse.set_hidden(original, true) {
            warn!("Could not hide {}: {}", original.display(), e);
        }

        progress.report(format!("Redirecting {} -> {}", source.display(), cache.display()));
        self.inner.reparse.create(source, cache)?;
        steps.push(Step::Redirected);

        self.inner
            .sync
            .start_monitoring(self.sync_config(cache, original))
            .await?;
        steps.push(Step::Monitoring);

        Ok(report.bytes_copied)
    }

    /// Undo `steps` in reverse. Returns a description of each undo that failed.
    async fn rollback(
        &self,
        source: &Path,
        original: &Path,
        cache: &Path,
        steps: Vec<Step>,
        progress: &Progress,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        for step in steps.into_iter().rev() {
            debug!("Rolling back {:?} for {}", step, source.display());
            let result = match step {
                Step::Monitoring => {
                    self.inner.sync.stop_monitoring(cache).await;
                    Ok(())
                }
                Step::Redirected => self.inner.reparse.remove(source),
                Step::SourceParked => {
                    let _ = self.inner.reparse.set_hidden(original, false);
                    tokio::fs::rename(original, source)
                        .await
                        .map_err(|e| CacheError::io(e, "restoring source", original))
                }
                Step::CachePopulated { created: true } if cache.is_dir() => match tokio::fs::remove_dir_all(cache).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        Err(CacheError::io(e, "deleting partial cache", cache))
                    }
                    _ => Ok(()),
                },
                Step::CachePopulated { .. } => Ok(()),
            };
            if let Err(e) = result {
                error!("Rollback step failed: {}", e);
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            progress.report("Rolled back");
        } else {
            progress.report(format!("Rollback incomplete: {}", failures.join("; ")));
        }
        failures
    }

    /// Stop accelerating `mount`: final sync, remove the redirection and put
    /// the original back. The cache is only deleted when everything else
    /// succeeded.
    pub async fn stop(
        &self,
        mount: &Path,
        original: &Path,
        cache: &Path,
        delete_cache: bool,
        progress: &Progress,
    ) -> Result<()> {
        let mount = layout::clean(&reparse::absolute(mount));
        let state = self.lifecycle(&mount);
        if state.is_transitional() {
            return Err(CacheError::Busy {
                path: mount,
                state: state.to_string(),
            });
        }
        self.set_lifecycle(&mount, LifecycleState::Stopping);
        progress.report(format!("Stopping acceleration of {}", mount.display()));
        info!("Stopping acceleration of {}", mount.display());

        match self.run_stop(&mount, original, cache, delete_cache, progress).await {
            Ok(()) => {
                self.inner.supervisor.remove_state(&mount);
                self.forget(&mount);
                self.set_lifecycle(&mount, LifecycleState::Unaccelerated);
                progress.report(format!("{} restored", mount.display()));
                Ok(())
            }
            Err(e) => {
                error!("Stopping {} failed: {}", mount.display(), e);
                self.set_lifecycle(&mount, LifecycleState::Degraded);
                self.inner.supervisor.record_error(
                    &mount,
                    "StopFailed",
                    e.to_string(),
                    Severity::High,
                    Utc::now(),
                );
                Err(e)
            }
        }
    }

    async fn run_stop(
        &self,
        mount: &Path,
        original: &Path,
        cache: &Path,
        delete_cache: bool,
        progress: &Progress,
    ) -> Result<()> {
        self.inner.sync.stop_monitoring(cache).await;

        let mut synced = true;
        if cache.is_dir() && original.is_dir() {
            progress.report("Final sync to original");
            match self.inner.sync.force_sync(cache, original, progress).await {
                Ok(report) if report.is_complete() => {}
                Ok(report) => {
                    warn!("Final sync left {} files behind", report.failures.len());
                    synced = false;
                }
                Err(e) => {
                    warn!("Final sync failed: {}", e);
                    synced = false;
                }
            }
        }

        if self.inner.reparse.is_redirection(mount) {
            self.inner.reparse.remove(mount)?;
        }

        let restored_from_cache = if original.is_dir() {
            if mount.symlink_metadata().is_ok() {
                return Err(CacheError::AlreadyExists {
                    path: mount.to_path_buf(),
                });
            }
            progress.report(format!("Restoring {} -> {}", original.display(), mount.display()));
            tokio::fs::rename(original, mount)
                .await
                .map_err(|e| CacheError::io(e, "restoring original", original))?;
            if let Err(e) = self.inner.reparse.set_hidden(mount, false) {
                warn!("Could not unhide {}: {}", mount.display(), e);
            }
            false
        } else if cache.is_dir() {
            warn!(
                "Original {} missing, rebuilding {} from the cache",
                original.display(),
                mount.display()
            );
            progress.report("Original missing, restoring from cache");
            let report = self
                .inner
                .copier
                .copy_tree(
                    cache,
                    mount,
                    &self.inner.settings.copy,
                    self.inner.settings.copy_concurrency,
                    progress,
                )
                .await?;
            if !report.is_complete() {
                return Err(CacheError::VerificationFailed {
                    path: mount.to_path_buf(),
                    reason: format!("{} files could not be restored", report.failures.len()),
                });
            }
            true
        } else {
            return Err(CacheError::NotFound {
                path: original.to_path_buf(),
            });
        };

        if delete_cache && cache.is_dir() {
            if !synced || restored_from_cache {
                warn!("Keeping {} since not every change reached the original", cache.display());
                progress.report("Cache kept: final sync was incomplete");
            } else {
                progress.report(format!("Deleting cache {}", cache.display()));
                if let Err(e) = tokio::fs::remove_dir_all(cache).await {
                    warn!("Failed to delete cache {}: {}", cache.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Stop using the stored record for `mount`.
    pub async fn stop_mount(&self, mount: &Path, delete_cache: bool, progress: &Progress) -> Result<()> {
        let record = self.mount(mount).ok_or_else(|| CacheError::UnknownMount {
            path: mount.to_path_buf(),
        })?;
        self.stop(
            &record.mount_point,
            &record.original_path,
            &record.cache_path,
            delete_cache,
            progress,
        )
        .await
    }

    /// Re-check the acceleration invariant for one mount. Read only.
    pub fn validate(&self, mount: &Path, original: &Path, cache: &Path) -> ValidationReport {
        ValidationReport {
            mount_point: mount.to_path_buf(),
            redirection: self.inner.reparse.validate(mount, cache),
            original_exists: original.is_dir(),
            cache_exists: cache.is_dir(),
        }
    }

    /// True iff `path` redirects to its cache and the original is in place.
    pub fn is_accelerated(&self, path: &Path) -> bool {
        match self.mount(path) {
            Some(record) => self
                .validate(&record.mount_point, &record.original_path, &record.cache_path)
                .is_valid(),
            None => {
                self.inner.reparse.is_redirection(path) && original_path_for(path).is_dir()
            }
        }
    }

    /// Mirror a mount's cache into its original now.
    pub async fn sync_now(&self, mount: &Path, progress: &Progress) -> Result<ForceSyncReport> {
        let record = self.mount(mount).ok_or_else(|| CacheError::UnknownMount {
            path: mount.to_path_buf(),
        })?;
        self.inner
            .sync
            .force_sync(&record.cache_path, &record.original_path, progress)
            .await
    }

    /// Rebuild supervisor state from stored records. With `monitor`, watching
    /// resumes for every mount whose redirection is still in place.
    pub async fn restore_states(
        &self,
        records: &[AcceleratedMount],
        monitor: bool,
        progress: &Progress,
    ) -> Vec<(PathBuf, LifecycleState)> {
        let mut restored = Vec::with_capacity(records.len());
        for record in records {
            let mount = &record.mount_point;
            let redirected = self.inner.reparse.is_redirection(mount);
            self.inner.mounts.lock().insert(reparse::normalize(mount), record.clone());
            self.inner
                .supervisor
                .record_state(mount, &record.original_path, &record.cache_path);
            self.inner.supervisor.set_active(mount, redirected);

            let state = if !redirected {
                LifecycleState::Unaccelerated
            } else if !monitor {
                if self.is_accelerated(mount) {
                    LifecycleState::Accelerated
                } else {
                    LifecycleState::Degraded
                }
            } else if record.cache_path.is_dir() && record.original_path.is_dir() {
                let config = self.sync_config(&record.cache_path, &record.original_path);
                match self.inner.sync.start_monitoring(config).await {
                    Ok(()) => LifecycleState::Accelerated,
                    Err(e) => {
                        warn!("Cannot monitor {}: {}", record.cache_path.display(), e);
                        LifecycleState::Degraded
                    }
                }
            } else {
                LifecycleState::Degraded
            };
            if state == LifecycleState::Unaccelerated {
                self.inner.lifecycle.lock().remove(&reparse::normalize(mount));
            } else {
                self.inner.lifecycle.lock().insert(reparse::normalize(mount), state);
            }
            progress.report(format!("{}: {}", mount.display(), state));
            restored.push((mount.clone(), state));
        }
        info!("Restored {} accelerations", restored.len());
        restored
    }

    pub async fn health_check(&self, progress: &Progress) -> Vec<HealthReport> {
        let reports = self
            .inner
            .supervisor
            .health_check(self, progress, Utc::now())
            .await;
        for report in &reports {
            self.settle_lifecycle(&report.mount_point, report.is_healthy());
            if !report.is_healthy() {
                continue;
            }
            let Some(mount) = self.mount(&report.mount_point) else {
                continue;
            };
            let cache = mount.cache_path.clone();
            match tokio::task::spawn_blocking(move || tree::dir_size(&cache)).await {
                Ok(size) => self.note_size(&mount.mount_point, size),
                Err(e) => debug!("Sizing {} failed: {}", mount.cache_path.display(), e),
            }
        }
        reports
    }

    /// Run recovery for `mount` now.
    pub async fn recover(&self, mount: &Path, progress: &Progress) -> Result<RecoveryOutcome> {
        let outcome = self
            .inner
            .supervisor
            .trigger_recovery(mount, self, progress, Utc::now())
            .await?;
        self.settle_lifecycle(mount, outcome.success);
        Ok(outcome)
    }

    fn settle_lifecycle(&self, mount: &Path, healthy: bool) {
        let state = self.lifecycle(mount);
        if !state.is_active() {
            return;
        }
        if healthy && self.is_accelerated(mount) {
            self.set_lifecycle(mount, LifecycleState::Accelerated);
        } else if !healthy {
            self.set_lifecycle(mount, LifecycleState::Degraded);
        }
    }

    fn note_sync_failure(&self, source_root: &Path, path: &Path, message: &str) {
        let Some(record) = self.mount_for_cache(source_root) else {
            return;
        };
        self.inner.supervisor.record_error(
            &record.mount_point,
            "SyncFailed",
            format!("{}: {}", path.display(), message),
            Severity::Medium,
            Utc::now(),
        );
        if self.lifecycle(&record.mount_point) == LifecycleState::Accelerated {
            self.set_lifecycle(&record.mount_point, LifecycleState::Degraded);
        }
    }

    /// Start the tasks that watch for sync failures and run scheduled
    /// recoveries. Idempotent.
    pub fn start_background(&self) {
        let Some(mut requests) = self.inner.requests.lock().take() else {
            return;
        };
        let mut events = self.inner.sync.subscribe();
        let cancel = self.inner.shutdown.clone();

        let manager = self.clone();
        let failures = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(SyncEvent::Failed { source_root, path, error }) => {
                            manager.note_sync_failure(&source_root, &path, &error)
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        let manager = self.clone();
        let cancel = self.inner.shutdown.clone();
        let recoveries = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => {
                            info!(
                                "Running scheduled recovery for {}",
                                request.mount_point.display()
                            );
                            if let Err(e) = manager.recover(&request.mount_point, &Progress::silent()).await {
                                warn!("Scheduled recovery failed: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        self.inner.background.lock().extend([failures, recoveries]);
    }

    /// Stop background work. With `final_sync`, every watched mount gets a
    /// last full sync first.
    pub async fn shutdown(&self, final_sync: bool) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if final_sync {
            for record in self.mounts() {
                if !self.inner.sync.is_monitoring(&record.cache_path).await {
                    continue;
                }
                self.inner.sync.stop_monitoring(&record.cache_path).await;
                if let Err(e) = self
                    .inner
                    .sync
                    .force_sync(&record.cache_path, &record.original_path, &Progress::silent())
                    .await
                {
                    warn!("Final sync of {} failed: {}", record.mount_point.display(), e);
                }
            }
        }
        self.inner.sync.shutdown().await;
    }
}

#[async_trait]
impl RecoveryActions for CacheManager {
    async fn validate(&self, mount: &Path, original: &Path, cache: &Path) -> bool {
        CacheManager::validate(self, mount, original, cache).is_valid()
    }

    async fn force_sync(&self, cache: &Path, original: &Path, progress: &Progress) -> bool {
        match self.inner.sync.force_sync(cache, original, progress).await {
            Ok(report) => report.is_complete(),
            Err(e) => {
                warn!("Recovery sync failed: {}", e);
                false
            }
        }
    }

    async fn stop(
        &self,
        mount: &Path,
        original: &Path,
        cache: &Path,
        delete_cache: bool,
        progress: &Progress,
    ) -> Result<()> {
        CacheManager::stop(self, mount, original, cache, delete_cache, progress).await
    }

    async fn accelerate(&self, source: &Path, cache_root: &Path, progress: &Progress) -> Result<()> {
        CacheManager::accelerate(self, source, cache_root, progress)
            .await
            .map(|_| ())
    }
}
