//! Credential refresh ahead of expiry.
//!
//! Due accounts are refreshed one at a time with a fixed pause between
//! calls, because the upstream credential endpoint is rate-sensitive. One
//! account's failure never stops the loop.
//!
//! | Refresher returns | Counted as | Account |
//! |-------------------|------------|---------|
//! | `Ok(Some(credential))` | refreshed | credential saved, `CONNECTED` |
//! | `Ok(None)` | failed (soft) | flagged `NEED_RECONNECT` |
//! | `Err(_)` or panic | failed (hard) | unchanged |
//!
//! Logs carry the store code, never the credential.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, info, warn};

use metricsync_core::{ConnectionStatus, Credential, RunLogEntry, RunStatus, StoreCode};

use super::types::{JobError, RefreshResult};
use crate::accounts::AccountRegistry;
use crate::config::REFRESH_HORIZON_RANGE;
use crate::run_log::RunLogSink;

/// Run log job name of a refresh invocation.
pub const REFRESH_JOB_NAME: &str = "refresh-expiring-credentials";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("credential refresh failed: {0}")]
    Upstream(String),
}

/// Renews one store's credential with the upstream provider.
///
/// `Ok(None)` means the provider declined to renew it.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, store_code: &StoreCode) -> Result<Option<Credential>, RefreshError>;
}

#[async_trait]
impl<R> CredentialRefresher for Arc<R>
where
    R: CredentialRefresher + ?Sized,
{
    async fn refresh(&self, store_code: &StoreCode) -> Result<Option<Credential>, RefreshError> {
        (**self).refresh(store_code).await
    }
}

/// Serial refresh of credentials expiring within a horizon.
pub struct CredentialRefreshScheduler {
    registry: Arc<dyn AccountRegistry>,
    refresher: Arc<dyn CredentialRefresher>,
    run_log: Arc<dyn RunLogSink>,
    delay: Duration,
}

impl core::fmt::Debug for CredentialRefreshScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialRefreshScheduler")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Refreshed,
    Declined,
    Failed,
}

impl CredentialRefreshScheduler {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        refresher: Arc<dyn CredentialRefresher>,
        run_log: Arc<dyn RunLogSink>,
        delay: Duration,
    ) -> Self {
        Self {
            registry,
            refresher,
            run_log,
            delay,
        }
    }

    /// Refresh every connected account whose credential expires within
    /// `horizon_hours`.
    ///
    /// Only a horizon outside `REFRESH_HORIZON_RANGE` is an error; every
    /// per-account problem is counted in the result instead.
    pub async fn refresh_expiring(&self, horizon_hours: u32) -> Result<RefreshResult, JobError> {
        if !REFRESH_HORIZON_RANGE.contains(&horizon_hours) {
            return Err(JobError::Configuration(format!(
                "refresh horizon must be within {}..={} hours, got {horizon_hours}",
                REFRESH_HORIZON_RANGE.start(),
                REFRESH_HORIZON_RANGE.end(),
            )));
        }

        let started = Instant::now();
        let horizon = chrono::Duration::hours(i64::from(horizon_hours));

        let due = match self.registry.list_expiring_within(horizon).await {
            Ok(due) => due,
            Err(err) => {
                error!(job = REFRESH_JOB_NAME, error = %err, "failed to list expiring credentials");
                let result = RefreshResult {
                    status: RunStatus::Failed,
                    ..RefreshResult::new(0, 0, 0, elapsed_ms(started))
                };
                self.append_summary(
                    RunStatus::Failed,
                    format!("failed to list expiring credentials: {err}"),
                    result.duration_ms,
                )
                .await;
                return Ok(result);
            }
        };

        info!(job = REFRESH_JOB_NAME, horizon_hours, due = due.len(), "credential refresh started");

        let mut refreshed = 0usize;
        let mut failed = 0usize;

        for (index, account) in due.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            match self.refresh_one(&account.store_code).await {
                Attempt::Refreshed => refreshed += 1,
                Attempt::Declined | Attempt::Failed => failed += 1,
            }
        }

        let result = RefreshResult::new(due.len(), refreshed, failed, elapsed_ms(started));

        info!(
            job = REFRESH_JOB_NAME,
            total = result.total,
            refreshed = result.refreshed,
            failed = result.failed,
            status = %result.status,
            duration_ms = result.duration_ms,
            "credential refresh finished"
        );

        self.append_summary(result.status, result.tally_message(), result.duration_ms)
            .await;
        Ok(result)
    }

    async fn refresh_one(&self, store_code: &StoreCode) -> Attempt {
        let refreshed = AssertUnwindSafe(self.refresher.refresh(store_code))
            .catch_unwind()
            .await;

        match refreshed {
            Ok(Ok(Some(credential))) => {
                match self.registry.save_credential(store_code, &credential).await {
                    Ok(()) => {
                        info!(
                            store_code = %store_code,
                            expires_at = %credential.expires_at,
                            "credential refreshed"
                        );
                        Attempt::Refreshed
                    }
                    Err(err) => {
                        error!(store_code = %store_code, error = %err, "failed to save refreshed credential");
                        Attempt::Failed
                    }
                }
            }
            Ok(Ok(None)) => {
                warn!(store_code = %store_code, "credential could not be renewed, flagging for reconnect");
                if let Err(err) = self
                    .registry
                    .set_status(store_code, ConnectionStatus::NeedReconnect)
                    .await
                {
                    warn!(store_code = %store_code, error = %err, "failed to flag store for reconnect");
                }
                Attempt::Declined
            }
            Ok(Err(err)) => {
                error!(store_code = %store_code, error = %err, "credential refresh failed");
                Attempt::Failed
            }
            Err(payload) => {
                let message = crate::panic::describe(payload.as_ref());
                error!(store_code = %store_code, panic = %message, "credential refresh panicked");
                Attempt::Failed
            }
        }
    }

    async fn append_summary(&self, status: RunStatus, message: String, duration_ms: u64) {
        let entry = RunLogEntry::summary(REFRESH_JOB_NAME, status, message, duration_ms);
        if let Err(err) = self.run_log.append(&entry).await {
            warn!(job = REFRESH_JOB_NAME, error = %err, "failed to write run log");
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
