//! Per-mount health tracking and recovery execution.

use super::state::{AccelerationState, ErrorRecord, Severity};
use super::strategy::{determine_strategy, schedule_delay, RecoveryStrategy};
use crate::error::{CacheError, Result};
use crate::progress::Progress;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Operations the supervisor needs from whoever owns the mounts.
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    async fn validate(&self, mount: &Path, original: &Path, cache: &Path) -> bool;

    async fn force_sync(&self, cache: &Path, original: &Path, progress: &Progress) -> bool;

    async fn stop(
        &self,
        mount: &Path,
        original: &Path,
        cache: &Path,
        delete_cache: bool,
        progress: &Progress,
    ) -> Result<()>;

    async fn accelerate(&self, source: &Path, cache_root: &Path, progress: &Progress) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Pause between stop and accelerate for Reset.
    pub reset_pause: Duration,
    /// Pause between stop and accelerate for Recreate.
    pub recreate_pause: Duration,
    /// Upper bound on the automatic retry delay.
    pub max_backoff: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            reset_pause: Duration::from_secs(2),
            recreate_pause: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30 * 60),
        }
    }
}

/// An automatic recovery that has come due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub mount_point: PathBuf,
    /// Strategy chosen when the request was scheduled.
    pub strategy: RecoveryStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub mount_point: PathBuf,
    pub strategy: RecoveryStrategy,
    pub attempt: u32,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub mount_point: PathBuf,
    pub issues: Vec<String>,
    pub recovery: Option<RecoveryOutcome>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub total_recovery_attempts: u32,
    pub active_accelerations: usize,
    pub total_accelerations: usize,
}

/// Errors younger than this fail the health check.
const HEALTH_ERROR_WINDOW_MINUTES: i64 = 60;

pub struct RecoverySupervisor {
    settings: RecoverySettings,
    states: Mutex<HashMap<PathBuf, AccelerationState>>,
    timers: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    requests: mpsc::UnboundedSender<RecoveryRequest>,
}

impl RecoverySupervisor {
    /// Create a supervisor and the channel its scheduled recoveries arrive on.
    pub fn new(settings: RecoverySettings) -> (Self, mpsc::UnboundedReceiver<RecoveryRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                states: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                requests: tx,
            },
            rx,
        )
    }

    /// Record that a mount is active. Existing history is cleared.
    pub fn record_state(&self, mount: &Path, original: &Path, cache: &Path) {
        let state = AccelerationState::new(mount, original, cache);
        self.states.lock().insert(mount.to_path_buf(), state);
        debug!("Tracking {}", mount.display());
    }

    pub fn set_active(&self, mount: &Path, active: bool) {
        if let Some(state) = self.states.lock().get_mut(mount) {
            state.is_active = active;
        }
        if !active {
            self.cancel_timer(mount);
        }
    }

    pub fn remove_state(&self, mount: &Path) -> Option<AccelerationState> {
        self.cancel_timer(mount);
        self.states.lock().remove(mount)
    }

    pub fn state(&self, mount: &Path) -> Option<AccelerationState> {
        self.states.lock().get(mount).cloned()
    }

    pub fn states(&self) -> Vec<AccelerationState> {
        self.states.lock().values().cloned().collect()
    }

    /// Append an error. High or worse on an active mount schedules an
    /// automatic recovery. Returns the delay when one was scheduled.
    pub fn record_error(
        &self,
        mount: &Path,
        kind: &str,
        message: impl Into<String>,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let message = message.into();
        let (strategy, attempts) = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(mount) else {
                warn!("Error for untracked mount {}: {} {}", mount.display(), kind, message);
                return None;
            };
            warn!(
                "Recorded {} error for {}: {}: {}",
                severity,
                mount.display(),
                kind,
                message
            );
            state.errors.push(ErrorRecord {
                at: now,
                kind: kind.to_string(),
                message,
                severity,
            });
            if severity < Severity::High || !state.is_active {
                return None;
            }
            (determine_strategy(state, now), state.recovery_attempts)
        };

        if strategy == RecoveryStrategy::None {
            return None;
        }
        let delay = schedule_delay(attempts, self.settings.max_backoff);
        self.schedule(mount, strategy, delay).then_some(delay)
    }

    fn schedule(&self, mount: &Path, strategy: RecoveryStrategy, delay: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to schedule recovery of {}", mount.display());
            return false;
        };
        let request = RecoveryRequest {
            mount_point: mount.to_path_buf(),
            strategy,
        };
        let tx = self.requests.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            info!(
                "Scheduled recovery due for {} ({})",
                request.mount_point.display(),
                request.strategy
            );
            let _ = tx.send(request);
        });
        if let Some(old) = self.timers.lock().insert(mount.to_path_buf(), handle) {
            old.abort();
        }
        info!(
            "Recovery of {} scheduled in {}s ({})",
            mount.display(),
            delay.as_secs(),
            strategy
        );
        true
    }

    fn cancel_timer(&self, mount: &Path) {
        if let Some(timer) = self.timers.lock().remove(mount) {
            timer.abort();
        }
    }

    /// Choose and run a strategy for `mount` now.
    pub async fn trigger_recovery(
        &self,
        mount: &Path,
        actions: &dyn RecoveryActions,
        progress: &Progress,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome> {
        let (state, strategy) = {
            let states = self.states.lock();
            let state = states.get(mount).ok_or_else(|| CacheError::UnknownMount {
                path: mount.to_path_buf(),
            })?;
            (state.clone(), determine_strategy(state, now))
        };
        if strategy == RecoveryStrategy::None {
            progress.report(format!("No recovery needed for {}", mount.display()));
            return Ok(RecoveryOutcome {
                mount_point: mount.to_path_buf(),
                strategy,
                attempt: state.recovery_attempts,
                success: true,
            });
        }
        self.execute(state, strategy, actions, progress, now).await
    }

    /// Run `strategy` for `mount` regardless of its error history.
    pub async fn execute_strategy(
        &self,
        mount: &Path,
        strategy: RecoveryStrategy,
        actions: &dyn RecoveryActions,
        progress: &Progress,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome> {
        let state = self.state(mount).ok_or_else(|| CacheError::UnknownMount {
            path: mount.to_path_buf(),
        })?;
        self.execute(state, strategy, actions, progress, now).await
    }

    async fn execute(
        &self,
        state: AccelerationState,
        strategy: RecoveryStrategy,
        actions: &dyn RecoveryActions,
        progress: &Progress,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome> {
        let mount = state.mount_point.clone();
        let attempt = {
            let mut states = self.states.lock();
            let tracked = states.get_mut(&mount).ok_or_else(|| CacheError::UnknownMount {
                path: mount.clone(),
            })?;
            tracked.recovery_attempts += 1;
            tracked.last_recovery_attempt = Some(now);
            tracked.recovery_attempts
        };
        self.cancel_timer(&mount);

        info!("Recovering {} with {} (attempt {})", mount.display(), strategy, attempt);
        progress.report(format!(
            "Recovering {} ({}, attempt {})",
            mount.display(),
            strategy,
            attempt
        ));

        let result = self.run(&state, strategy, actions, progress).await;
        let success = match result {
            Ok(success) => success,
            Err(e) => {
                error!("Recovery of {} failed: {}", mount.display(), e);
                progress.report(format!("Recovery failed: {e}"));
                self.record_error(&mount, "RecoveryException", e.to_string(), Severity::High, now);
                false
            }
        };

        if success {
            if let Some(tracked) = self.states.lock().get_mut(&mount) {
                tracked.clear_history();
                if strategy == RecoveryStrategy::Fallback {
                    tracked.is_active = false;
                }
            }
            info!("Recovered {} with {}", mount.display(), strategy);
        } else {
            warn!("Recovery of {} with {} did not succeed", mount.display(), strategy);
        }

        Ok(RecoveryOutcome {
            mount_point: mount,
            strategy,
            attempt,
            success,
        })
    }

    async fn run(
        &self,
        state: &AccelerationState,
        strategy: RecoveryStrategy,
        actions: &dyn RecoveryActions,
        progress: &Progress,
    ) -> Result<bool> {
        let AccelerationState {
            mount_point: mount,
            original_path: original,
            cache_path: cache,
            ..
        } = state;

        match strategy {
            RecoveryStrategy::None => Ok(true),
            RecoveryStrategy::Retry => {
                if actions.validate(mount, original, cache).await {
                    progress.report("Validation passed, nothing to retry");
                    return Ok(true);
                }
                Ok(actions.force_sync(cache, original, progress).await)
            }
            RecoveryStrategy::Reset | RecoveryStrategy::Recreate => {
                let (delete_cache, pause) = if strategy == RecoveryStrategy::Reset {
                    (false, self.settings.reset_pause)
                } else {
                    (true, self.settings.recreate_pause)
                };
                let cache_root = cache_root_of(cache).ok_or_else(|| {
                    CacheError::internal(format!(
                        "cannot derive cache root from {}",
                        cache.display()
                    ))
                })?;
                actions
                    .stop(mount, original, cache, delete_cache, progress)
                    .await?;
                tokio::time::sleep(pause).await;
                actions.accelerate(mount, &cache_root, progress).await?;
                Ok(true)
            }
            RecoveryStrategy::Fallback => {
                actions.stop(mount, original, cache, false, progress).await?;
                progress.report("Acceleration stopped, original restored");
                Ok(true)
            }
        }
    }

    /// Check every active mount, record problems as High errors and try to
    /// recover those that have any.
    pub async fn health_check(
        &self,
        actions: &dyn RecoveryActions,
        progress: &Progress,
        now: DateTime<Utc>,
    ) -> Vec<HealthReport> {
        let active: Vec<AccelerationState> = self
            .states
            .lock()
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        progress.report(format!("Checking {} active accelerations", active.len()));

        let mut reports = Vec::with_capacity(active.len());
        for state in active {
            let mut issues = Vec::new();
            if !state.mount_point.exists() {
                issues.push(format!("mount point missing: {}", state.mount_point.display()));
            }
            if !state.original_path.is_dir() {
                issues.push(format!("original missing: {}", state.original_path.display()));
            }
            if !state.cache_path.is_dir() {
                issues.push(format!("cache missing: {}", state.cache_path.display()));
            }
            if !actions
                .validate(&state.mount_point, &state.original_path, &state.cache_path)
                .await
            {
                issues.push("redirection validation failed".to_string());
            }
            let recent = state
                .errors_within(now, ChronoDuration::minutes(HEALTH_ERROR_WINDOW_MINUTES))
                .count();
            if recent > 0 {
                issues.push(format!("{recent} errors in the last hour"));
            }

            let mut report = HealthReport {
                mount_point: state.mount_point.clone(),
                issues,
                recovery: None,
            };
            if report.is_healthy() {
                debug!("{} is healthy", state.mount_point.display());
            } else {
                progress.report(format!(
                    "{}: {}",
                    state.mount_point.display(),
                    report.issues.join("; ")
                ));
                self.record_error(
                    &state.mount_point,
                    "HealthCheck",
                    report.issues.join("; "),
                    Severity::High,
                    now,
                );
                match self
                    .trigger_recovery(&state.mount_point, actions, progress, now)
                    .await
                {
                    Ok(outcome) => report.recovery = Some(outcome),
                    Err(e) => warn!("Recovery of {} failed: {}", state.mount_point.display(), e),
                }
            }
            reports.push(report);
        }
        reports
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        let states = self.states.lock();
        states.values().fold(
            ErrorStatistics {
                total_accelerations: states.len(),
                ..Default::default()
            },
            |mut stats, state| {
                stats.total_errors += state.errors.len();
                stats.total_recovery_attempts += state.recovery_attempts;
                if state.is_active {
                    stats.active_accelerations += 1;
                }
                stats
            },
        )
    }
}

impl Drop for RecoverySupervisor {
    fn drop(&mut self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }
}

/// `<root>/<drive>/<name>` → `<root>`.
pub fn cache_root_of(cache_path: &Path) -> Option<PathBuf> {
    cache_path.parent()?.parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeActions {
        valid: AtomicBool,
        sync_fails: AtomicBool,
        stop_fails: AtomicBool,
        syncs: AtomicUsize,
        stops: Mutex<Vec<(PathBuf, bool)>>,
        accelerations: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl RecoveryActions for FakeActions {
        async fn validate(&self, _: &Path, _: &Path, _: &Path) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        async fn force_sync(&self, _: &Path, _: &Path, _: &Progress) -> bool {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            !self.sync_fails.load(Ordering::SeqCst)
        }

        async fn stop(&self, mount: &Path, _: &Path, _: &Path, delete: bool, _: &Progress) -> Result<()> {
            self.stops.lock().push((mount.to_path_buf(), delete));
            if self.stop_fails.load(Ordering::SeqCst) {
                return Err(CacheError::internal("stop failed"));
            }
            Ok(())
        }

        async fn accelerate(&self, source: &Path, root: &Path, _: &Progress) -> Result<()> {
            self.accelerations
                .lock()
                .push((source.to_path_buf(), root.to_path_buf()));
            Ok(())
        }
    }

    fn supervisor() -> RecoverySupervisor {
        let settings = RecoverySettings {
            reset_pause: Duration::from_millis(1),
            recreate_pause: Duration::from_millis(1),
            ..Default::default()
        };
        RecoverySupervisor::new(settings).0
    }

    // the original lives under a renamed directory so suffix stripping would be wrong
    fn track(sup: &RecoverySupervisor) -> PathBuf {
        let mount = PathBuf::from("/data/Projects");
        sup.record_state(&mount, Path::new("/data/Projects-backup"), Path::new("/cache/data/Projects"));
        mount
    }

    #[tokio::test]
    async fn test_recreate_targets_mount_point() {
        let sup = supervisor();
        let mount = track(&sup);
        let now = Utc::now();
        for _ in 0..3 {
            sup.record_error(&mount, "Test", "bad", Severity::High, now);
        }
        let actions = FakeActions::default();
        let outcome = sup
            .trigger_recovery(&mount, &actions, &Progress::silent(), now)
            .await
            .unwrap();

        assert_eq!(outcome.strategy, RecoveryStrategy::Recreate);
        assert!(outcome.success);
        assert_eq!(*actions.stops.lock(), vec![(mount.clone(), true)]);
        assert_eq!(
            *actions.accelerations.lock(),
            vec![(mount.clone(), PathBuf::from("/cache"))]
        );
        let state = sup.state(&mount).unwrap();
        assert!(state.errors.is_empty());
        assert_eq!(state.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_syncs_when_invalid() {
        let sup = supervisor();
        let mount = track(&sup);
        let actions = FakeActions::default();
        let outcome = sup
            .trigger_recovery(&mount, &actions, &Progress::silent(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::Retry);
        assert_eq!(actions.syncs.load(Ordering::SeqCst), 1);

        actions.valid.store(true, Ordering::SeqCst);
        let later = Utc::now() + ChronoDuration::minutes(10);
        sup.trigger_recovery(&mount, &actions, &Progress::silent(), later)
            .await
            .unwrap();
        assert_eq!(actions.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_deactivates() {
        let sup = supervisor();
        let mount = track(&sup);
        let actions = FakeActions::default();
        let outcome = sup
            .execute_strategy(&mount, RecoveryStrategy::Fallback, &actions, &Progress::silent(), Utc::now())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(!sup.state(&mount).unwrap().is_active);
        assert_eq!(sup.error_statistics().active_accelerations, 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_end_in_fallback() {
        let sup = supervisor();
        let mount = track(&sup);
        let actions = FakeActions::default();
        actions.sync_fails.store(true, Ordering::SeqCst);
        actions.stop_fails.store(true, Ordering::SeqCst);
        let t0 = Utc::now();
        let at = |minutes| t0 + ChronoDuration::minutes(minutes);
        let progress = Progress::silent();

        for minutes in [0, 6, 12] {
            let outcome = sup.trigger_recovery(&mount, &actions, &progress, at(minutes)).await.unwrap();
            assert_eq!(outcome.strategy, RecoveryStrategy::Retry);
            assert!(!outcome.success);
        }
        // retries are spent and nothing else applies yet
        let idle = sup.trigger_recovery(&mount, &actions, &progress, at(17)).await.unwrap();
        assert_eq!(idle.strategy, RecoveryStrategy::None);

        for _ in 0..5 {
            sup.record_error(&mount, "Test", "flaky", Severity::Medium, at(18));
        }
        for minutes in [18, 19] {
            let outcome = sup.trigger_recovery(&mount, &actions, &progress, at(minutes)).await.unwrap();
            assert_eq!(outcome.strategy, RecoveryStrategy::Reset);
            assert!(!outcome.success);
        }
        assert_eq!(sup.state(&mount).unwrap().recovery_attempts, 5);
        assert!(actions.accelerations.lock().is_empty());

        // the error burst has aged out of the window
        actions.stop_fails.store(false, Ordering::SeqCst);
        let outcome = sup.trigger_recovery(&mount, &actions, &progress, at(51)).await.unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::Fallback);
        assert!(outcome.success);
        assert_eq!(outcome.attempt, 6);
        assert_eq!(actions.stops.lock().last(), Some(&(mount.clone(), false)));
        assert!(!sup.state(&mount).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_high_error_schedules_request() {
        let settings = RecoverySettings {
            max_backoff: Duration::from_millis(20),
            ..Default::default()
        };
        let (sup, mut rx) = RecoverySupervisor::new(settings);
        let mount = track(&sup);

        assert!(sup
            .record_error(&mount, "Test", "minor", Severity::Medium, Utc::now())
            .is_none());
        let delay = sup.record_error(&mount, "Test", "bad", Severity::High, Utc::now());
        assert_eq!(delay, Some(Duration::from_millis(20)));

        let request = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.mount_point, mount);
        assert_eq!(request.strategy, RecoveryStrategy::Retry);
    }

    #[test]
    fn test_unknown_mount_errors_ignored() {
        let sup = supervisor();
        assert!(sup
            .record_error(Path::new("/nowhere"), "Test", "x", Severity::Critical, Utc::now())
            .is_none());
        assert_eq!(sup.error_statistics(), ErrorStatistics::default());
    }

    #[test]
    fn test_cache_root_of() {
        assert_eq!(
            cache_root_of(Path::new("/fast/cache/C/Data")),
            Some(PathBuf::from("/fast/cache"))
        );
        assert_eq!(cache_root_of(Path::new("/x")), None);
    }
}
