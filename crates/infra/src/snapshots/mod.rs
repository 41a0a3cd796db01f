//! Metric snapshot storage.
//!
//! Snapshots are unique per `(store_code, kind, snapshot_date)`. `upsert`
//! replaces the stored row for an existing key instead of adding a second
//! one, so re-running a day's sync is always safe.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::NaiveDate;

use metricsync_core::{MetricSnapshot, StoreCode, SyncKind};

pub mod postgres;

pub use postgres::PostgresSnapshotStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot storage error: {0}")]
    Storage(String),
    #[error("snapshot decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for its natural key.
    async fn upsert(&self, snapshot: &MetricSnapshot) -> Result<(), SnapshotError>;

    async fn get(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
        snapshot_date: NaiveDate,
    ) -> Result<Option<MetricSnapshot>, SnapshotError>;

    /// Every snapshot of one store and kind, oldest day first.
    async fn list_for_store(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
    ) -> Result<Vec<MetricSnapshot>, SnapshotError>;
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn upsert(&self, snapshot: &MetricSnapshot) -> Result<(), SnapshotError> {
        (**self).upsert(snapshot).await
    }

    async fn get(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
        snapshot_date: NaiveDate,
    ) -> Result<Option<MetricSnapshot>, SnapshotError> {
        (**self).get(store_code, kind, snapshot_date).await
    }

    async fn list_for_store(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
    ) -> Result<Vec<MetricSnapshot>, SnapshotError> {
        (**self).list_for_store(store_code, kind).await
    }
}

type SnapshotKey = (StoreCode, SyncKind, NaiveDate);

/// In-memory snapshot store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    rows: RwLock<HashMap<SnapshotKey, MetricSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored rows across all stores and kinds.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn upsert(&self, snapshot: &MetricSnapshot) -> Result<(), SnapshotError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.insert(snapshot.key(), snapshot.clone());
        Ok(())
    }

    async fn get(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
        snapshot_date: NaiveDate,
    ) -> Result<Option<MetricSnapshot>, SnapshotError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&(store_code.clone(), kind, snapshot_date)).cloned())
    }

    async fn list_for_store(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
    ) -> Result<Vec<MetricSnapshot>, SnapshotError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<MetricSnapshot> = rows
            .values()
            .filter(|s| &s.store_code == store_code && s.kind == kind)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.snapshot_date);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn upsert_replaces_same_day() {
        let store = InMemorySnapshotStore::new();
        let code = StoreCode::new("shop-1").unwrap();

        store
            .upsert(&MetricSnapshot::new(code.clone(), SyncKind::ShopMetrics, day(1), json!({"orders": 3})))
            .await
            .unwrap();
        store
            .upsert(&MetricSnapshot::new(code.clone(), SyncKind::ShopMetrics, day(1), json!({"orders": 5})))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let row = store.get(&code, SyncKind::ShopMetrics, day(1)).await.unwrap().unwrap();
        assert_eq!(row.metrics, json!({"orders": 5}));
    }

    #[tokio::test]
    async fn kinds_and_days_are_separate_rows() {
        let store = InMemorySnapshotStore::new();
        let code = StoreCode::new("shop-1").unwrap();

        for (kind, d) in [
            (SyncKind::ShopMetrics, 2),
            (SyncKind::ShopMetrics, 1),
            (SyncKind::AdsMetrics, 1),
        ] {
            store
                .upsert(&MetricSnapshot::new(code.clone(), kind, day(d), json!({})))
                .await
                .unwrap();
        }

        assert_eq!(store.len(), 3);
        let shop = store.list_for_store(&code, SyncKind::ShopMetrics).await.unwrap();
        let days: Vec<_> = shop.iter().map(|s| s.snapshot_date).collect();
        assert_eq!(days, vec![day(1), day(2)]);
    }
}
