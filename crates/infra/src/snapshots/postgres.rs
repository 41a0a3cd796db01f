//! Postgres-backed snapshot store (`metric_snapshots` table).
//!
//! The primary key `(store_code, kind, snapshot_date)` plus
//! `ON CONFLICT ... DO UPDATE` makes `upsert` idempotent per store and day.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use metricsync_core::{MetricSnapshot, StoreCode, SyncKind};

use super::{SnapshotError, SnapshotStore};

#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(
        skip(self, snapshot),
        fields(
            store_code = %snapshot.store_code,
            kind = %snapshot.kind,
            snapshot_date = %snapshot.snapshot_date
        ),
        err
    )]
    async fn upsert(&self, snapshot: &MetricSnapshot) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO metric_snapshots (store_code, kind, snapshot_date, metrics, fetched_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (store_code, kind, snapshot_date)
            DO UPDATE SET
                metrics = EXCLUDED.metrics,
                fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(snapshot.store_code.as_str())
        .bind(snapshot.kind.as_str())
        .bind(snapshot.snapshot_date)
        .bind(&snapshot.metrics)
        .bind(snapshot.fetched_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_snapshot", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(store_code = %store_code, kind = %kind), err)]
    async fn get(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
        snapshot_date: NaiveDate,
    ) -> Result<Option<MetricSnapshot>, SnapshotError> {
        let row = sqlx::query(
            r#"
            SELECT store_code, kind, snapshot_date, metrics, fetched_at
            FROM metric_snapshots
            WHERE store_code = $1 AND kind = $2 AND snapshot_date = $3
            "#,
        )
        .bind(store_code.as_str())
        .bind(kind.as_str())
        .bind(snapshot_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self), fields(store_code = %store_code, kind = %kind), err)]
    async fn list_for_store(
        &self,
        store_code: &StoreCode,
        kind: SyncKind,
    ) -> Result<Vec<MetricSnapshot>, SnapshotError> {
        let rows = sqlx::query(
            r#"
            SELECT store_code, kind, snapshot_date, metrics, fetched_at
            FROM metric_snapshots
            WHERE store_code = $1 AND kind = $2
            ORDER BY snapshot_date ASC
            "#,
        )
        .bind(store_code.as_str())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_snapshots", e))?;

        rows.iter().map(snapshot_from_row).collect()
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<MetricSnapshot, SnapshotError> {
    let decode = |e: sqlx::Error| SnapshotError::Decode(e.to_string());

    let code: String = row.try_get("store_code").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let snapshot_date: NaiveDate = row.try_get("snapshot_date").map_err(decode)?;
    let metrics: JsonValue = row.try_get("metrics").map_err(decode)?;
    let fetched_at: DateTime<Utc> = row.try_get("fetched_at").map_err(decode)?;

    Ok(MetricSnapshot {
        store_code: StoreCode::new(&code).map_err(|e| SnapshotError::Decode(e.to_string()))?,
        kind: kind
            .parse()
            .map_err(|e: metricsync_core::DomainError| SnapshotError::Decode(e.to_string()))?,
        snapshot_date,
        metrics,
        fetched_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SnapshotError {
    SnapshotError::Storage(format!("{operation}: {err}"))
}
