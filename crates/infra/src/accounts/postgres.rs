//! Postgres-backed account registry (`store_accounts` table).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use metricsync_core::{ConnectionStatus, Credential, StoreAccount, StoreCode};

use super::{AccountRegistry, RegistryError};

#[derive(Debug, Clone)]
pub struct PostgresAccountRegistry {
    pool: PgPool,
}

impl PostgresAccountRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRegistry for PostgresAccountRegistry {
    #[instrument(skip(self), err)]
    async fn list_connected(&self) -> Result<Vec<StoreAccount>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT store_code, token_expires_at, status
            FROM store_accounts
            WHERE status = 'CONNECTED'
            ORDER BY store_code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_connected", e))?;

        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self), fields(horizon_hours = horizon.num_hours()), err)]
    async fn list_expiring_within(
        &self,
        horizon: Duration,
    ) -> Result<Vec<StoreAccount>, RegistryError> {
        let cutoff = Utc::now().checked_add_signed(horizon).ok_or_else(|| {
            RegistryError::Storage(format!("expiry cutoff out of range for {horizon}"))
        })?;
        let rows = sqlx::query(
            r#"
            SELECT store_code, token_expires_at, status
            FROM store_accounts
            WHERE status = 'CONNECTED'
              AND (token_expires_at IS NULL OR token_expires_at <= $1)
            ORDER BY token_expires_at ASC NULLS FIRST, store_code ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expiring_within", e))?;

        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self), fields(store_code = %store_code, status = %status), err)]
    async fn set_status(
        &self,
        store_code: &StoreCode,
        status: ConnectionStatus,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE store_accounts
            SET status = $2, updated_at = NOW()
            WHERE store_code = $1
            "#,
        )
        .bind(store_code.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_status", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(store_code.clone()));
        }
        Ok(())
    }

    // The credential is deliberately not a span field.
    #[instrument(skip(self, credential), fields(store_code = %store_code), err)]
    async fn save_credential(
        &self,
        store_code: &StoreCode,
        credential: &Credential,
    ) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE store_accounts
            SET access_token_encrypted = $2,
                token_expires_at = $3,
                status = 'CONNECTED',
                updated_at = NOW()
            WHERE store_code = $1
            "#,
        )
        .bind(store_code.as_str())
        .bind(credential.expose_token())
        .bind(credential.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_credential", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(store_code.clone()));
        }
        Ok(())
    }
}

fn account_from_row(row: &PgRow) -> Result<StoreAccount, RegistryError> {
    let code: String = row
        .try_get("store_code")
        .map_err(|e| map_sqlx_error("decode store_code", e))?;
    let expires_at: Option<DateTime<Utc>> = row
        .try_get("token_expires_at")
        .map_err(|e| map_sqlx_error("decode token_expires_at", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("decode status", e))?;

    Ok(StoreAccount {
        store_code: StoreCode::new(&code).map_err(|e| RegistryError::Storage(e.to_string()))?,
        credential_expires_at: expires_at,
        status: status
            .parse()
            .map_err(|e: metricsync_core::DomainError| RegistryError::Storage(e.to_string()))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RegistryError {
    RegistryError::Storage(format!("{operation}: {err}"))
}
