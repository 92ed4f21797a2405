//! Repeating timers as a stream of ticks.
//!
//! Engines never sleep on their own cadence. They consume [`Tick`]s from a
//! receiver, which in production is fed by interval tasks and in tests by
//! hand through [`Scheduler::sender`].

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which periodic job a tick is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    /// Process pending operations whose delay has elapsed.
    FastSweep,
    /// Drain the periodic-mode queue.
    PeriodicSweep,
    /// Drop finished queue items past their retention.
    QueueCleanup,
    /// Run the recovery supervisor's health check.
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub kind: TickKind,
    pub at: DateTime<Utc>,
}

impl Tick {
    pub fn now(kind: TickKind) -> Self {
        Self { kind, at: Utc::now() }
    }
}

/// Owns the interval tasks feeding one tick channel.
pub struct Scheduler {
    tx: mpsc::Sender<Tick>,
    cancel: CancellationToken,
    timers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler and the receiving end of its ticks.
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::Receiver<Tick>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                tx,
                cancel,
                timers: Vec::new(),
            },
            rx,
        )
    }

    /// Emit a `kind` tick every `period`, starting one period from now.
    pub fn every(&mut self, kind: TickKind, period: Duration) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // a full channel means the consumer is behind; skip this tick
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(Tick::now(kind)) {
                            break;
                        }
                    }
                }
            }
            debug!("{:?} timer stopped", kind);
        });
        self.timers.push(handle);
    }

    /// Sender for injecting ticks by hand.
    pub fn sender(&self) -> mpsc::Sender<Tick> {
        self.tx.clone()
    }

    /// Stop every timer.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
    }
}
