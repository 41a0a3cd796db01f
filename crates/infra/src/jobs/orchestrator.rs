//! Daily sync orchestration.
//!
//! `run_daily_sync` lists eligible stores, runs each one through the batch
//! executor under its store lock, and classifies every store as exactly one
//! of success, failed or skipped:
//!
//! 1. lock held elsewhere: skipped (a `SKIPPED` row is written right away)
//! 2. lock taken and the sync errored, panicked or reported an error: failed
//! 3. otherwise: success
//!
//! Exactly one summary row is written per invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use metricsync_core::{RunLogEntry, RunStatus, StoreCode, SyncKind};

use super::executor::{BatchConfig, BatchExecutor, ItemFailure};
use super::refresh::{CredentialRefreshScheduler, CredentialRefresher, elapsed_ms};
use super::types::{DailySyncResult, JobError, RefreshResult, StoreOutcome, TenantOutcome};
use crate::accounts::AccountRegistry;
use crate::config::SyncSettings;
use crate::locks::{LockOutcome, TenantLockManager};
use crate::run_log::RunLogSink;
use crate::sync::{SyncError, SyncReport, TenantSync};

/// Reason recorded for a store whose lock was held by another run.
pub const LOCK_HELD_REASON: &str = "store lock held by another run";

/// What a worker reports for one store before classification.
#[derive(Debug)]
enum Attempt {
    Synced(SyncReport),
    Skipped,
}

/// Entry point for the scheduled sync jobs.
pub struct SyncOrchestrator {
    registry: Arc<dyn AccountRegistry>,
    locks: TenantLockManager,
    run_log: Arc<dyn RunLogSink>,
    settings: SyncSettings,
    syncs: HashMap<SyncKind, Arc<dyn TenantSync>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl core::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.settings)
            .field("kinds", &self.syncs.keys().collect::<Vec<_>>())
            .field("refresher", &self.refresher.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        locks: TenantLockManager,
        run_log: Arc<dyn RunLogSink>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            locks,
            run_log,
            settings,
            syncs: HashMap::new(),
            refresher: None,
        }
    }

    /// Register the sync function for a job kind (replaces any previous one).
    pub fn register_sync(&mut self, kind: SyncKind, sync: Arc<dyn TenantSync>) {
        self.syncs.insert(kind, sync);
    }

    pub fn with_sync(mut self, kind: SyncKind, sync: Arc<dyn TenantSync>) -> Self {
        self.register_sync(kind, sync);
        self
    }

    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Kinds that have a registered sync function.
    pub fn kinds(&self) -> Vec<SyncKind> {
        let mut kinds: Vec<SyncKind> = self.syncs.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Run the daily sync for `kind` over every connected store.
    ///
    /// Returns only after the whole batch finished. Only configuration
    /// problems are returned as errors.
    pub async fn run_daily_sync(&self, kind: SyncKind) -> Result<DailySyncResult, JobError> {
        self.settings.validate()?;

        let sync = self
            .syncs
            .get(&kind)
            .cloned()
            .ok_or_else(|| JobError::Configuration(format!("no sync registered for {kind}")))?;

        let concurrency = self.settings.concurrency_for(kind);
        let job_name = kind.job_name();
        let executor: BatchExecutor<StoreCode, Attempt, SyncError> =
            BatchExecutor::new(BatchConfig::new(concurrency).with_name(job_name))
                .map_err(|e| JobError::Configuration(e.to_string()))?
                .on_progress(move |processed, total| {
                    debug!(job = job_name, processed, total, "store finished");
                })
                .on_error(move |store_code, failure| {
                    warn!(job = job_name, store_code = %store_code, error = %failure, "store sync failed");
                });

        let started = Instant::now();

        let accounts = match self.registry.list_connected().await {
            Ok(accounts) => accounts,
            Err(err) => {
                error!(job = job_name, error = %err, "failed to list connected stores");
                let result = DailySyncResult::empty(kind, RunStatus::Failed, elapsed_ms(started));
                self.append(RunLogEntry::summary(
                    job_name,
                    RunStatus::Failed,
                    format!("failed to list connected stores: {err}"),
                    result.duration_ms,
                ))
                .await;
                return Ok(result);
            }
        };

        if accounts.is_empty() {
            info!(job = job_name, "no eligible stores");
            let result = DailySyncResult::empty(kind, RunStatus::Success, elapsed_ms(started));
            self.append(RunLogEntry::summary(
                job_name,
                result.status,
                result.tally_message(),
                result.duration_ms,
            ))
            .await;
            return Ok(result);
        }

        let stores: Vec<StoreCode> = accounts.into_iter().map(|a| a.store_code).collect();
        info!(job = job_name, stores = stores.len(), concurrency, "daily sync started");

        let locks = self.locks.clone();
        let run_log = Arc::clone(&self.run_log);
        let summary = executor
            .run(stores, move |store_code| {
                let locks = locks.clone();
                let sync = Arc::clone(&sync);
                let run_log = Arc::clone(&run_log);
                async move { sync_store(locks, sync, run_log, job_name, store_code).await }
            })
            .await;

        let outcomes: Vec<StoreOutcome> = summary
            .results
            .into_iter()
            .map(|item| StoreOutcome {
                store_code: item.item,
                outcome: classify(item.outcome),
            })
            .collect();

        let result = DailySyncResult::from_outcomes(kind, outcomes, elapsed_ms(started));

        if result.all_skipped() {
            warn!(job = job_name, skipped = result.skipped, "every store was skipped, locks may be stuck");
        }
        info!(
            job = job_name,
            total = result.total,
            successful = result.successful,
            failed = result.failed,
            skipped = result.skipped,
            records_processed = result.records_processed,
            status = %result.status,
            duration_ms = result.duration_ms,
            "daily sync finished"
        );

        self.append(RunLogEntry::summary(
            job_name,
            result.status,
            result.tally_message(),
            result.duration_ms,
        ))
        .await;

        Ok(result)
    }

    /// Refresh credentials expiring within `horizon_hours`, one at a time.
    pub async fn refresh_expiring(&self, horizon_hours: u32) -> Result<RefreshResult, JobError> {
        let refresher = self
            .refresher
            .clone()
            .ok_or_else(|| JobError::Configuration("no credential refresher configured".to_string()))?;

        CredentialRefreshScheduler::new(
            Arc::clone(&self.registry),
            refresher,
            Arc::clone(&self.run_log),
            self.settings.refresh_delay,
        )
        .refresh_expiring(horizon_hours)
        .await
    }

    /// Refresh with the configured horizon.
    pub async fn refresh_due(&self) -> Result<RefreshResult, JobError> {
        self.refresh_expiring(self.settings.refresh_horizon_hours).await
    }

    async fn append(&self, entry: RunLogEntry) {
        append_run_log(self.run_log.as_ref(), &entry).await;
    }
}

/// One store: lock, sync, unlock.
async fn sync_store(
    locks: TenantLockManager,
    sync: Arc<dyn TenantSync>,
    run_log: Arc<dyn RunLogSink>,
    job_name: &'static str,
    store_code: StoreCode,
) -> Result<Attempt, SyncError> {
    let started = Instant::now();

    match locks.with_tenant_lock(&store_code, || sync.sync(&store_code)).await {
        LockOutcome::Ran(result) => result.map(Attempt::Synced),
        LockOutcome::Skipped => {
            info!(job = job_name, store_code = %store_code, "store locked by another run, skipping");
            let entry = RunLogEntry::for_store(
                store_code.clone(),
                job_name,
                RunStatus::Skipped,
                LOCK_HELD_REASON,
                elapsed_ms(started),
            );
            append_run_log(run_log.as_ref(), &entry).await;
            Ok(Attempt::Skipped)
        }
        LockOutcome::Panicked(message) => Err(SyncError::Panicked(message)),
        LockOutcome::Unavailable(err) => Err(SyncError::Lock(err)),
    }
}

fn classify(outcome: Result<Attempt, ItemFailure<SyncError>>) -> TenantOutcome {
    match outcome {
        Ok(Attempt::Skipped) => TenantOutcome::Skipped {
            reason: LOCK_HELD_REASON.to_string(),
        },
        Ok(Attempt::Synced(SyncReport {
            error: Some(error), ..
        })) => TenantOutcome::Failed { error },
        Ok(Attempt::Synced(report)) => TenantOutcome::Success {
            records_processed: report.records_processed,
        },
        Err(failure) => TenantOutcome::Failed {
            error: failure.to_string(),
        },
    }
}

async fn append_run_log(run_log: &dyn RunLogSink, entry: &RunLogEntry) {
    if let Err(err) = run_log.append(entry).await {
        warn!(job = %entry.job_name, error = %err, "failed to write run log");
    }
}
