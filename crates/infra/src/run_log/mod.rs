//! Run log sink.
//!
//! Append-only audit trail of job invocations. Rows are never updated once
//! written.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use metricsync_core::{RunLogEntry, RunStatus};

pub mod postgres;

pub use postgres::PostgresRunLog;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunLogError {
    #[error("run log storage error: {0}")]
    Storage(String),
    #[error("run log decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait RunLogSink: Send + Sync {
    async fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError>;

    /// Most recent rows for `job_name`, newest first.
    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<RunLogEntry>, RunLogError>;
}

#[async_trait]
impl<S> RunLogSink for Arc<S>
where
    S: RunLogSink + ?Sized,
{
    async fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError> {
        (**self).append(entry).await
    }

    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<RunLogEntry>, RunLogError> {
        (**self).recent(job_name, limit).await
    }
}

/// In-memory run log for tests/dev. Keeps rows in append order.
#[derive(Debug, Default)]
pub struct InMemoryRunLog {
    entries: Mutex<Vec<RunLogEntry>>,
}

impl InMemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every row, in append order.
    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn summaries(&self) -> Vec<RunLogEntry> {
        self.entries().into_iter().filter(RunLogEntry::is_summary).collect()
    }

    pub fn with_status(&self, status: RunStatus) -> Vec<RunLogEntry> {
        self.entries().into_iter().filter(|e| e.status == status).collect()
    }
}

#[async_trait]
impl RunLogSink for InMemoryRunLog {
    async fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<RunLogEntry>, RunLogError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .rev()
            .filter(|e| e.job_name == job_name)
            .take(limit)
            .cloned()
            .collect())
    }
}
