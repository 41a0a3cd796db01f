//! Tenant sync functions.
//!
//! A `TenantSync` performs one store's sync for one job kind: fetch from the
//! upstream platform, then persist idempotently. The orchestrator only sees
//! the returned `SyncReport` or `SyncError`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use metricsync_core::{ConnectionStatus, MetricSnapshot, StoreCode, SyncKind};

use crate::accounts::AccountRegistry;
use crate::locks::LockError;
use crate::snapshots::SnapshotStore;

/// Tenant-scoped sync failure. Never escapes the batch executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("store lock unavailable: {0}")]
    Lock(#[from] LockError),
    #[error("sync panicked: {0}")]
    Panicked(String),
}

/// Error from the opaque upstream metrics client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The upstream rejected the store's credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// What one store's sync reports back.
///
/// A report carrying `error` counts as a failed store even though the sync
/// returned normally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub records_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub fn processed(records_processed: u64) -> Self {
        Self {
            records_processed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            records_processed: 0,
            error: Some(error.into()),
        }
    }
}

/// Per-kind sync of one store. Must be idempotent per `(store, date)`.
#[async_trait]
pub trait TenantSync: Send + Sync {
    async fn sync(&self, store_code: &StoreCode) -> Result<SyncReport, SyncError>;
}

#[async_trait]
impl<S> TenantSync for Arc<S>
where
    S: TenantSync + ?Sized,
{
    async fn sync(&self, store_code: &StoreCode) -> Result<SyncReport, SyncError> {
        (**self).sync(store_code).await
    }
}

/// Opaque upstream metrics client. Timeouts are the implementor's concern.
#[async_trait]
pub trait MetricsFetcher: Send + Sync {
    async fn fetch(
        &self,
        kind: SyncKind,
        store_code: &StoreCode,
        date: NaiveDate,
    ) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl<F> MetricsFetcher for Arc<F>
where
    F: MetricsFetcher + ?Sized,
{
    async fn fetch(
        &self,
        kind: SyncKind,
        store_code: &StoreCode,
        date: NaiveDate,
    ) -> Result<JsonValue, FetchError> {
        (**self).fetch(kind, store_code, date).await
    }
}

/// Standard sync for a kind: fetch one day's metrics, upsert one snapshot.
pub struct MetricsSync {
    kind: SyncKind,
    fetcher: Arc<dyn MetricsFetcher>,
    snapshots: Arc<dyn SnapshotStore>,
    registry: Arc<dyn AccountRegistry>,
    snapshot_date: Option<NaiveDate>,
}

impl core::fmt::Debug for MetricsSync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetricsSync")
            .field("kind", &self.kind)
            .field("snapshot_date", &self.snapshot_date)
            .finish_non_exhaustive()
    }
}

impl MetricsSync {
    pub fn new(
        kind: SyncKind,
        fetcher: Arc<dyn MetricsFetcher>,
        snapshots: Arc<dyn SnapshotStore>,
        registry: Arc<dyn AccountRegistry>,
    ) -> Self {
        Self {
            kind,
            fetcher,
            snapshots,
            registry,
            snapshot_date: None,
        }
    }

    /// Pin the snapshot day instead of using the current UTC date.
    pub fn for_date(mut self, date: NaiveDate) -> Self {
        self.snapshot_date = Some(date);
        self
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    async fn flag_reconnect(&self, store_code: &StoreCode) {
        if let Err(err) = self
            .registry
            .set_status(store_code, ConnectionStatus::NeedReconnect)
            .await
        {
            warn!(store_code = %store_code, error = %err, "failed to flag store for reconnect");
        }
    }
}

#[async_trait]
impl TenantSync for MetricsSync {
    async fn sync(&self, store_code: &StoreCode) -> Result<SyncReport, SyncError> {
        let date = self.snapshot_date.unwrap_or_else(|| Utc::now().date_naive());

        let payload = match self.fetcher.fetch(self.kind, store_code, date).await {
            Ok(payload) => payload,
            Err(FetchError::Unauthorized(msg)) => {
                warn!(
                    store_code = %store_code,
                    kind = %self.kind,
                    "upstream rejected credential, flagging store for reconnect"
                );
                self.flag_reconnect(store_code).await;
                return Err(SyncError::UpstreamFetch(format!("unauthorized: {msg}")));
            }
            Err(FetchError::Upstream(msg)) => return Err(SyncError::UpstreamFetch(msg)),
        };

        let records = match &payload {
            JsonValue::Object(fields) => fields.len() as u64,
            other => {
                return Err(SyncError::UpstreamFetch(format!(
                    "expected a metrics object, got {}",
                    json_type_name(other)
                )));
            }
        };

        let snapshot = MetricSnapshot::new(store_code.clone(), self.kind, date, payload);
        self.snapshots
            .upsert(&snapshot)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        debug!(store_code = %store_code, kind = %self.kind, %date, records, "snapshot stored");
        Ok(SyncReport::processed(records))
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Duration;
    use metricsync_core::StoreAccount;
    use serde_json::json;

    use crate::accounts::InMemoryAccountRegistry;
    use crate::snapshots::InMemorySnapshotStore;

    /// Returns queued responses in order.
    struct ScriptedFetcher {
        responses: Mutex<Vec<Result<JsonValue, FetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(mut responses: Vec<Result<JsonValue, FetchError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl MetricsFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _kind: SyncKind,
            _store_code: &StoreCode,
            _date: NaiveDate,
        ) -> Result<JsonValue, FetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::Upstream("no scripted response".into())))
        }
    }

    fn fixture(
        responses: Vec<Result<JsonValue, FetchError>>,
    ) -> (MetricsSync, Arc<InMemorySnapshotStore>, Arc<InMemoryAccountRegistry>, StoreCode) {
        let code = StoreCode::new("shop-1").unwrap();
        let registry = InMemoryAccountRegistry::arc();
        registry.insert(StoreAccount::connected(code.clone(), Utc::now() + Duration::days(5)));
        let snapshots = InMemorySnapshotStore::arc();
        let sync = MetricsSync::new(
            SyncKind::ShopMetrics,
            ScriptedFetcher::new(responses),
            snapshots.clone(),
            registry.clone(),
        )
        .for_date(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        (sync, snapshots, registry, code)
    }

    #[tokio::test]
    async fn same_day_twice_overwrites_snapshot() {
        let (sync, snapshots, _registry, code) = fixture(vec![
            Ok(json!({"orders": 1, "visitors": 10})),
            Ok(json!({"orders": 2, "visitors": 12})),
        ]);

        assert_eq!(sync.sync(&code).await.unwrap(), SyncReport::processed(2));
        assert_eq!(sync.sync(&code).await.unwrap(), SyncReport::processed(2));

        assert_eq!(snapshots.len(), 1);
        let row = snapshots
            .get(&code, SyncKind::ShopMetrics, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.metrics, json!({"orders": 2, "visitors": 12}));
    }

    #[tokio::test]
    async fn unauthorized_flags_reconnect() {
        let (sync, snapshots, registry, code) =
            fixture(vec![Err(FetchError::Unauthorized("token revoked".into()))]);

        let err = sync.sync(&code).await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamFetch(_)));
        assert_eq!(registry.get(&code).unwrap().status, ConnectionStatus::NeedReconnect);
        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn non_object_payload_is_upstream_failure() {
        let (sync, snapshots, registry, code) = fixture(vec![Ok(json!([1, 2, 3]))]);

        let err = sync.sync(&code).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::UpstreamFetch("expected a metrics object, got array".into())
        );
        assert_eq!(registry.get(&code).unwrap().status, ConnectionStatus::Connected);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn failed_report_carries_its_error() {
        assert_eq!(SyncReport::processed(3).error, None);
        assert_eq!(SyncReport::failed("partial page").error.as_deref(), Some("partial page"));
    }
}
