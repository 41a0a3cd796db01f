//! Sync orchestration core and its adapters: batch execution, per-store
//! locks, credential refresh, persistence, configuration.

pub mod accounts;
pub mod config;
pub mod db;
pub mod jobs;
pub mod locks;
mod panic;
pub mod run_log;
pub mod snapshots;
pub mod sync;

pub use accounts::{AccountRegistry, InMemoryAccountRegistry, PostgresAccountRegistry, RegistryError};
pub use config::{ConfigError, DatabaseSettings, LockBackendKind, LockSettings, SyncSettings};
pub use db::{Database, DatabaseError};
pub use jobs::{
    CredentialRefresher, DailySyncResult, JobError, RefreshResult, SyncOrchestrator, SyncSchedule,
    SyncScheduler,
};
pub use locks::{LockBackend, LockError, LockOutcome, TenantLockManager};
pub use run_log::{InMemoryRunLog, PostgresRunLog, RunLogSink};
pub use snapshots::{InMemorySnapshotStore, PostgresSnapshotStore, SnapshotStore};
pub use sync::{FetchError, MetricsFetcher, MetricsSync, SyncError, SyncReport, TenantSync};
