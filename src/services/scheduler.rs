//! # Reminder scheduler
//!
//! Fires a sweep job on a fixed interval, independent of the broker.
//!
//! ```text
//! Idle ──tick──▶ Firing ──job done (ok or err)──▶ Idle
//!   ▲                │
//!   └── tick while Firing: skipped (Skip) or run up to N at once (Bounded)
//! ```
//!
//! The first tick fires one interval after `start`. Sweep failures and
//! panics are logged and counted; they never stop later ticks. The
//! scheduler holds no business state between ticks.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Semaphore, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerTickError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// At most one sweep at a time; ticks that arrive while firing are dropped.
    Skip,
    /// Up to `n` concurrent sweeps; ticks beyond that are dropped.
    Bounded(usize),
}

impl OverlapPolicy {
    fn limit(&self) -> usize {
        match self {
            OverlapPolicy::Skip => 1,
            OverlapPolicy::Bounded(limit) => (*limit).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Firing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTick {
    pub sequence: u64,
    pub fired_at: DateTime<Utc>,
}

#[async_trait]
pub trait SweepJob: Send + Sync {
    async fn run(&self, tick: ScheduleTick) -> Result<(), SchedulerTickError>;
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    fired: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl SchedulerCounters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            fired: self.fired.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub fired: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct ReminderScheduler {
    interval: Duration,
    policy: OverlapPolicy,
    shutdown_grace: Duration,
    job: Arc<dyn SweepJob>,
}

impl ReminderScheduler {
    pub fn new(interval: Duration, policy: OverlapPolicy, job: Arc<dyn SweepJob>) -> Self {
        Self {
            interval,
            policy,
            shutdown_grace: Duration::from_secs(30),
            job,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn start(self) -> SchedulerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let counters = Arc::new(SchedulerCounters::default());
        let permits = Arc::new(Semaphore::new(self.policy.limit()));

        info!(
            interval_seconds = self.interval.as_secs_f64(),
            policy = ?self.policy,
            "Starting reminder scheduler"
        );

        let task = tokio::spawn(Self::run(
            self.interval,
            self.shutdown_grace,
            self.job,
            Arc::clone(&permits),
            Arc::clone(&counters),
            cancel_rx,
        ));

        SchedulerHandle {
            cancel: cancel_tx,
            task,
            counters,
            permits,
            limit: self.policy.limit(),
        }
    }

    async fn run(
        period: Duration,
        shutdown_grace: Duration,
        job: Arc<dyn SweepJob>,
        permits: Arc<Semaphore>,
        counters: Arc<SchedulerCounters>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut running: JoinSet<Result<(), SchedulerTickError>> = JoinSet::new();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    sequence += 1;
                    let tick = ScheduleTick { sequence, fired_at: Utc::now() };

                    match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => {
                            counters.fired.fetch_add(1, Ordering::Relaxed);
                            debug!(sequence, "Reminder sweep firing");

                            let job = Arc::clone(&job);
                            running.spawn(async move {
                                let result = job.run(tick).await;
                                drop(permit);
                                result
                            });
                        }
                        Err(_) => {
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                            warn!(sequence, "Previous reminder sweep still running, skipping tick");
                        }
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    record(&counters, joined);
                }
            }
        }

        info!(in_flight = running.len(), "Reminder scheduler stopping");

        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(joined) = running.join_next().await {
                record(&counters, joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(aborted = running.len(), "Reminder sweeps still running at shutdown, aborting");
            running.abort_all();
        }
    }
}

fn record(
    counters: &SchedulerCounters,
    joined: Result<Result<(), SchedulerTickError>, tokio::task::JoinError>,
) {
    let failure = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => SchedulerTickError::Panicked(e.to_string()),
    };

    counters.failed.fetch_add(1, Ordering::Relaxed);
    error!(error = %failure, "Reminder sweep failed");
}

pub struct SchedulerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<SchedulerCounters>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl SchedulerHandle {
    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    pub fn state(&self) -> SchedulerState {
        if self.permits.available_permits() < self.limit {
            SchedulerState::Firing
        } else {
            SchedulerState::Idle
        }
    }

    /// Stops ticking and waits for in-flight sweeps (bounded by the grace period).
    pub async fn stop(self) -> SchedulerStats {
        let SchedulerHandle {
            cancel,
            task,
            counters,
            ..
        } = self;

        let _ = cancel.send(true);

        if let Err(e) = task.await {
            error!(error = %e, "Reminder scheduler task failed");
        }

        counters.snapshot()
    }
}
