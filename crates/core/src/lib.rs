//! `metricsync-core`: domain types shared by the sync orchestration core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod account;
pub mod error;
pub mod id;
pub mod run_log;
pub mod snapshot;

pub use account::{ConnectionStatus, Credential, StoreAccount};
pub use error::{DomainError, DomainResult};
pub use id::{RunLogId, StoreCode};
pub use run_log::{RunLogEntry, RunStatus};
pub use snapshot::{MetricSnapshot, SyncKind};
