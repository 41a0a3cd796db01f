//! Postgres advisory-lock backend.
//!
//! Uses session-level `pg_try_advisory_lock`, so the lock is visible to every
//! process connected to the same database. Each held lock pins one pooled
//! connection until release, because advisory locks belong to the session
//! that took them.
//!
//! ## Failure Handling
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Pool exhausted / closed, I/O error | `LockError::Unreachable` |
//! | Any other SQLx error | `LockError::Backend` |
//! | Unlock fails or reports "not held" | connection is detached and closed, which frees the lock server-side |

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{instrument, warn};

use metricsync_core::StoreCode;

use super::{LockBackend, LockError};

/// Default key namespace, so store locks never collide with other advisory
/// lock users of the same database.
pub const DEFAULT_NAMESPACE: &str = "metricsync:store";

enum Slot {
    /// Acquisition in flight; blocks concurrent local attempts.
    Reserved,
    Held(PoolConnection<Postgres>),
}

/// Cross-process store locks backed by Postgres advisory locks.
pub struct PostgresAdvisoryLockBackend {
    pool: PgPool,
    namespace: String,
    held: Mutex<HashMap<StoreCode, Slot>>,
}

impl core::fmt::Debug for PostgresAdvisoryLockBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresAdvisoryLockBackend")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl PostgresAdvisoryLockBackend {
    pub fn new(pool: PgPool) -> Self {
        Self::with_namespace(pool, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_key(&self, store_code: &StoreCode) -> String {
        lock_key(&self.namespace, store_code)
    }

    async fn try_session_lock(
        &self,
        store_code: &StoreCode,
    ) -> Result<Option<PoolConnection<Postgres>>, LockError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;

        let acquired: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(self.lock_key(store_code))
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("pg_try_advisory_lock", e))?;

        Ok(acquired.then_some(conn))
    }
}

#[async_trait]
impl LockBackend for PostgresAdvisoryLockBackend {
    #[instrument(skip(self), fields(store_code = %store_code), err)]
    async fn try_acquire(&self, store_code: &StoreCode) -> Result<bool, LockError> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if held.contains_key(store_code) {
                return Ok(false);
            }
            held.insert(store_code.clone(), Slot::Reserved);
        }

        let result = self.try_session_lock(store_code).await;

        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(Some(conn)) => {
                held.insert(store_code.clone(), Slot::Held(conn));
                Ok(true)
            }
            Ok(None) => {
                held.remove(store_code);
                Ok(false)
            }
            Err(err) => {
                held.remove(store_code);
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(store_code = %store_code), err)]
    async fn release(&self, store_code: &StoreCode) -> Result<(), LockError> {
        let slot = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(store_code);

        let mut conn = match slot {
            Some(Slot::Held(conn)) => conn,
            Some(Slot::Reserved) => {
                // Acquisition still in flight on another task; leave it alone.
                self.held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(store_code.clone(), Slot::Reserved);
                return Ok(());
            }
            None => return Ok(()),
        };

        let unlocked: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
                .bind(self.lock_key(store_code))
                .fetch_one(&mut *conn)
                .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(store_code = %store_code, "advisory lock was not held by this session");
                drop(conn.detach());
                Ok(())
            }
            Err(err) => {
                // Closing the session releases every advisory lock it holds.
                drop(conn.detach());
                Err(map_sqlx_error("pg_advisory_unlock", err))
            }
        }
    }
}

fn lock_key(namespace: &str, store_code: &StoreCode) -> String {
    format!("{namespace}:{store_code}")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LockError::Unreachable(format!("{operation}: {err}"))
        }
        other => LockError::Backend(format!("{operation}: {other}")),
    }
}
