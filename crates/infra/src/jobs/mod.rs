//! Sync jobs: bounded batch execution, orchestration, credential refresh.
//!
//! ## Design
//!
//! - Jobs are per kind and run over every eligible store
//! - A fixed worker budget per kind bounds upstream parallelism
//! - Overlapping runs for the same store are skipped, never queued
//! - Store-level failures are counted and logged, never raised
//! - Every invocation leaves exactly one summary row in the run log
//!
//! ## Components
//!
//! - `BatchExecutor`: generic bounded-concurrency runner with hooks
//! - `SyncOrchestrator`: `run_daily_sync` / `refresh_expiring`
//! - `CredentialRefreshScheduler`: serial refresh with an inter-call delay
//! - `SyncScheduler`: interval driver with a shutdown handle

pub mod executor;
pub mod orchestrator;
pub mod refresh;
pub mod scheduler;
pub mod types;

pub use executor::{BatchConfig, BatchError, BatchExecutor, BatchSummary, ItemFailure, ItemResult};
pub use orchestrator::{LOCK_HELD_REASON, SyncOrchestrator};
pub use refresh::{CredentialRefreshScheduler, CredentialRefresher, REFRESH_JOB_NAME, RefreshError};
pub use scheduler::{SchedulerHandle, SyncSchedule, SyncScheduler};
pub use types::{
    DailySyncResult, JobError, RefreshResult, StoreOutcome, TenantOutcome, summary_status,
};
