//! Append-only audit records of job executions.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{RunLogId, StoreCode};

/// Terminal (or in-flight) state recorded for a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
    Running,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Skipped => "SKIPPED",
            RunStatus::Running => "RUNNING",
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            "SKIPPED" => Ok(RunStatus::Skipped),
            "RUNNING" => Ok(RunStatus::Running),
            other => Err(DomainError::unknown("run status", other)),
        }
    }
}

/// One immutable run log row.
///
/// `store_code == None` marks the per-invocation summary row; per-store rows
/// carry the store they describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: RunLogId,
    pub store_code: Option<StoreCode>,
    pub job_name: String,
    pub status: RunStatus,
    pub message: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl RunLogEntry {
    /// Summary row for a whole job invocation.
    pub fn summary(
        job_name: impl Into<String>,
        status: RunStatus,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: RunLogId::new(),
            store_code: None,
            job_name: job_name.into(),
            status,
            message: message.into(),
            duration_ms,
            created_at: Utc::now(),
        }
    }

    /// Row describing a single store within a job invocation.
    pub fn for_store(
        store_code: StoreCode,
        job_name: impl Into<String>,
        status: RunStatus,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            store_code: Some(store_code),
            ..Self::summary(job_name, status, message, duration_ms)
        }
    }

    pub fn is_summary(&self) -> bool {
        self.store_code.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_rows_have_no_store() {
        let row = RunLogEntry::summary("daily-shop-metrics-sync", RunStatus::Success, "ok", 12);
        assert!(row.is_summary());

        let code = StoreCode::new("shop-1").unwrap();
        let row = RunLogEntry::for_store(code.clone(), "job", RunStatus::Skipped, "locked", 0);
        assert!(!row.is_summary());
        assert_eq!(row.store_code, Some(code));
    }

    #[test]
    fn status_storage_form_round_trips() {
        for status in [
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Skipped,
            RunStatus::Running,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
    }
}
