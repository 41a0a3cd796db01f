//! Database handle.
//!
//! The pool is opened explicitly at process start, handed to every Postgres
//! adapter, and closed at shutdown. Nothing in the crate holds a global pool.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseSettings;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[source] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await
            .map_err(DatabaseError::Connect)?;

        info!(max_connections = settings.max_connections, "database pool opened");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(DatabaseError::Migrate)?;
        info!("database migrations applied");
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}
