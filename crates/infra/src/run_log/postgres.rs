//! Postgres-backed run log (`sync_run_logs` table).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use metricsync_core::{RunLogEntry, RunLogId, StoreCode};

use super::{RunLogError, RunLogSink};

#[derive(Debug, Clone)]
pub struct PostgresRunLog {
    pool: PgPool,
}

impl PostgresRunLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLogSink for PostgresRunLog {
    #[instrument(
        skip(self, entry),
        fields(job = %entry.job_name, status = %entry.status),
        err
    )]
    async fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError> {
        let duration_ms = i64::try_from(entry.duration_ms).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO sync_run_logs (id, store_code, job_name, status, message, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.store_code.as_ref().map(StoreCode::as_str))
        .bind(&entry.job_name)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(duration_ms)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_run_log", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<RunLogEntry>, RunLogError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT id, store_code, job_name, status, message, duration_ms, created_at
            FROM sync_run_logs
            WHERE job_name = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_run_logs", e))?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &PgRow) -> Result<RunLogEntry, RunLogError> {
    let decode = |e: sqlx::Error| RunLogError::Decode(e.to_string());

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let store_code: Option<String> = row.try_get("store_code").map_err(decode)?;
    let job_name: String = row.try_get("job_name").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let message: String = row.try_get("message").map_err(decode)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    let domain = |e: metricsync_core::DomainError| RunLogError::Decode(e.to_string());

    Ok(RunLogEntry {
        id: RunLogId::from_uuid(id),
        store_code: store_code.map(StoreCode::new).transpose().map_err(domain)?,
        job_name,
        status: status.parse().map_err(domain)?,
        message,
        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
        created_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RunLogError {
    RunLogError::Storage(format!("{operation}: {err}"))
}
