//! Interval scheduler for the sync jobs.
//!
//! One tokio task owns both timers. Jobs run inline on that task, so a slow
//! run delays the next tick instead of overlapping it, and missed ticks are
//! skipped rather than replayed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use super::orchestrator::SyncOrchestrator;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    /// Period of the daily sync of every registered kind
    pub daily_interval: Duration,
    /// Period of the credential refresh
    pub refresh_interval: Duration,
    /// Fire both jobs immediately instead of after one full period
    pub run_on_start: bool,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            daily_interval: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(60 * 60),
            run_on_start: false,
        }
    }
}

impl SyncSchedule {
    pub fn with_daily_interval(mut self, interval: Duration) -> Self {
        self.daily_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }
}

/// Handle to stop a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for the scheduler task to exit.
    ///
    /// A job already in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "sync scheduler task ended abnormally");
        }
    }
}

pub struct SyncScheduler;

impl SyncScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn(orchestrator: Arc<SyncOrchestrator>, schedule: SyncSchedule) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut daily = ticker(schedule.daily_interval, schedule.run_on_start);
            let mut refresh = ticker(schedule.refresh_interval, schedule.run_on_start);

            info!(
                daily_interval_secs = schedule.daily_interval.as_secs(),
                refresh_interval_secs = schedule.refresh_interval.as_secs(),
                "sync scheduler started"
            );

            loop {
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = daily.tick() => run_daily(&orchestrator).await,
                    _ = refresh.tick() => run_refresh(&orchestrator).await,
                }
            }

            info!("sync scheduler stopped");
        });

        SchedulerHandle { shutdown, join }
    }
}

/// Longest period a ticker accepts; larger values are clamped.
const MAX_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn ticker(period: Duration, immediately: bool) -> tokio::time::Interval {
    let period = period.clamp(Duration::from_millis(1), MAX_PERIOD);
    let now = Instant::now();
    let start = if immediately {
        now
    } else {
        now.checked_add(period).unwrap_or(now)
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_daily(orchestrator: &SyncOrchestrator) {
    for kind in orchestrator.kinds() {
        if let Err(err) = orchestrator.run_daily_sync(kind).await {
            error!(kind = %kind, error = %err, "daily sync could not start");
        }
    }
}

async fn run_refresh(orchestrator: &SyncOrchestrator) {
    if let Err(err) = orchestrator.refresh_due().await {
        error!(error = %err, "credential refresh could not start");
    }
}
