//! Job result types and status policy.

use serde::{Deserialize, Serialize};

use metricsync_core::{RunStatus, StoreCode, SyncKind};

use crate::config::ConfigError;

/// Fault that aborts a job before any store is touched.
///
/// Store-level failures never surface here; they are reported through the
/// job result and the run log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<ConfigError> for JobError {
    fn from(err: ConfigError) -> Self {
        JobError::Configuration(err.to_string())
    }
}

/// Terminal state of one store in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TenantOutcome {
    Success { records_processed: u64 },
    Failed { error: String },
    /// Lock held by another run; the sync was not invoked.
    Skipped { reason: String },
}

impl TenantOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TenantOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub store_code: StoreCode,
    #[serde(flatten)]
    pub outcome: TenantOutcome,
}

/// Result of one `run_daily_sync` invocation.
///
/// `outcomes` follows the order the registry listed the stores in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySyncResult {
    pub job_name: String,
    pub kind: SyncKind,
    pub status: RunStatus,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_processed: u64,
    pub duration_ms: u64,
    pub outcomes: Vec<StoreOutcome>,
}

impl DailySyncResult {
    /// Zero-count result for a run that never reached any store.
    pub fn empty(kind: SyncKind, status: RunStatus, duration_ms: u64) -> Self {
        Self {
            job_name: kind.job_name().to_string(),
            kind,
            status,
            total: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            records_processed: 0,
            duration_ms,
            outcomes: Vec::new(),
        }
    }

    /// Reduce per-store outcomes into counters and the job status.
    pub fn from_outcomes(kind: SyncKind, outcomes: Vec<StoreOutcome>, duration_ms: u64) -> Self {
        let mut result = Self::empty(kind, RunStatus::Success, duration_ms);
        result.total = outcomes.len();

        for entry in &outcomes {
            match &entry.outcome {
                TenantOutcome::Success { records_processed } => {
                    result.successful += 1;
                    result.records_processed += records_processed;
                }
                TenantOutcome::Failed { .. } => result.failed += 1,
                TenantOutcome::Skipped { .. } => result.skipped += 1,
            }
        }

        result.status = summary_status(result.successful, result.failed);
        result.outcomes = outcomes;
        result
    }

    /// Whether every store was skipped because its lock was held.
    pub fn all_skipped(&self) -> bool {
        self.total > 0 && self.skipped == self.total
    }

    fn failed_stores(&self) -> impl Iterator<Item = &StoreCode> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome.is_failed())
            .map(|o| &o.store_code)
    }

    /// Human-readable tally for the summary run log row.
    ///
    /// Carries counts and store codes only.
    pub fn tally_message(&self) -> String {
        if self.total == 0 {
            return "no eligible stores".to_string();
        }

        let mut message = format!(
            "{} stores: {} successful, {} failed, {} skipped; {} records processed",
            self.total, self.successful, self.failed, self.skipped, self.records_processed
        );

        if self.failed > 0 {
            let failed: Vec<&str> = self.failed_stores().map(StoreCode::as_str).collect();
            message.push_str(&format!("; failed stores: {}", failed.join(", ")));
        }
        if self.all_skipped() {
            message.push_str("; every store was skipped, locks may be stuck");
        }
        message
    }
}

/// Result of one `refresh_expiring` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResult {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub status: RunStatus,
    pub duration_ms: u64,
}

impl RefreshResult {
    pub fn new(total: usize, refreshed: usize, failed: usize, duration_ms: u64) -> Self {
        // Nothing attempted counts as success; otherwise one refresh is enough.
        let status = if total == 0 || refreshed > 0 {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        Self {
            total,
            refreshed,
            failed,
            status,
            duration_ms,
        }
    }

    pub fn tally_message(&self) -> String {
        if self.total == 0 {
            return "no credentials due for refresh".to_string();
        }
        format!(
            "{} credentials due: {} refreshed, {} failed",
            self.total, self.refreshed, self.failed
        )
    }
}

/// Status of a daily sync summary row.
///
/// `FAILED` only when at least one store failed and none succeeded. Skipped
/// stores count toward neither side.
pub fn summary_status(successful: usize, failed: usize) -> RunStatus {
    if failed == 0 || successful > 0 {
        RunStatus::Success
    } else {
        RunStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(code: &str, outcome: TenantOutcome) -> StoreOutcome {
        StoreOutcome {
            store_code: StoreCode::new(code).unwrap(),
            outcome,
        }
    }

    #[test]
    fn status_policy() {
        assert_eq!(summary_status(0, 0), RunStatus::Success);
        assert_eq!(summary_status(3, 0), RunStatus::Success);
        assert_eq!(summary_status(1, 5), RunStatus::Success);
        assert_eq!(summary_status(0, 1), RunStatus::Failed);
    }

    #[test]
    fn skipped_counts_as_neither_success_nor_failure() {
        let result = DailySyncResult::from_outcomes(
            SyncKind::ShopMetrics,
            vec![
                outcome("a", TenantOutcome::Skipped { reason: "locked".into() }),
                outcome("b", TenantOutcome::Success { records_processed: 4 }),
                outcome("c", TenantOutcome::Failed { error: "boom".into() }),
            ],
            10,
        );

        assert_eq!((result.total, result.successful, result.failed, result.skipped), (3, 1, 1, 1));
        assert_eq!(result.records_processed, 4);
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(
            result.tally_message(),
            "3 stores: 1 successful, 1 failed, 1 skipped; 4 records processed; failed stores: c"
        );
    }

    #[test]
    fn all_skipped_is_called_out() {
        let result = DailySyncResult::from_outcomes(
            SyncKind::AdsMetrics,
            vec![outcome("a", TenantOutcome::Skipped { reason: "locked".into() })],
            1,
        );
        assert_eq!(result.status, RunStatus::Success);
        assert!(result.all_skipped());
        assert!(result.tally_message().contains("every store was skipped"));
    }

    #[test]
    fn refresh_status_policy() {
        assert_eq!(RefreshResult::new(0, 0, 0, 0).status, RunStatus::Success);
        assert_eq!(RefreshResult::new(2, 1, 1, 0).status, RunStatus::Success);
        assert_eq!(RefreshResult::new(2, 0, 2, 0).status, RunStatus::Failed);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let value = serde_json::to_value(outcome("a", TenantOutcome::Success { records_processed: 2 })).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"store_code": "a", "outcome": "success", "records_processed": 2})
        );
    }
}
