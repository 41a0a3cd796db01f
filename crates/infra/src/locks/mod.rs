//! Per-store mutual exclusion for sync runs.
//!
//! ## Design
//!
//! - Locks are keyed by store code only; two stores never contend
//! - Acquisition is non-blocking: a held lock means the run is skipped, not queued
//! - The lock is released on every exit path of the guarded closure, panics included
//! - Backends decide visibility: in-process, Postgres advisory locks, or Redis
//!
//! ## Components
//!
//! - `LockBackend`: try-acquire / release primitive
//! - `TenantLockManager`: scoped `with_tenant_lock` on top of a backend
//! - `LockOutcome`: ran / skipped / panicked / backend unavailable

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::PgPool;
use tracing::{debug, error, warn};

use metricsync_core::StoreCode;

use crate::config::{ConfigError, LockBackendKind, LockSettings};

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLockBackend;
pub use postgres::PostgresAdvisoryLockBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;

/// Failure of the lock coordination store itself (not contention).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unreachable: {0}")]
    Unreachable(String),
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Non-blocking lock primitive keyed by store code.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Try to take the lock. `Ok(false)` means someone else holds it.
    async fn try_acquire(&self, store_code: &StoreCode) -> Result<bool, LockError>;

    /// Release a lock previously acquired by this backend instance.
    async fn release(&self, store_code: &StoreCode) -> Result<(), LockError>;
}

#[async_trait]
impl<B> LockBackend for Arc<B>
where
    B: LockBackend + ?Sized,
{
    async fn try_acquire(&self, store_code: &StoreCode) -> Result<bool, LockError> {
        (**self).try_acquire(store_code).await
    }

    async fn release(&self, store_code: &StoreCode) -> Result<(), LockError> {
        (**self).release(store_code).await
    }
}

/// Result of a `with_tenant_lock` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the closure ran to completion.
    Ran(T),
    /// The lock was held elsewhere; the closure was not invoked.
    Skipped,
    /// The closure panicked. The lock was released regardless.
    Panicked(String),
    /// The backend failed before the closure could run.
    Unavailable(LockError),
}

/// Scoped, fail-fast per-store locking.
#[derive(Clone)]
pub struct TenantLockManager {
    backend: Arc<dyn LockBackend>,
}

impl core::fmt::Debug for TenantLockManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TenantLockManager").finish_non_exhaustive()
    }
}

impl TenantLockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Process-local manager, for tests and single-instance deployments.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLockBackend::new()))
    }

    /// Build the manager for the configured backend.
    ///
    /// Selecting Redis without the `redis` feature is a configuration error.
    pub fn from_settings(settings: &LockSettings, pool: &PgPool) -> Result<Self, ConfigError> {
        let backend: Arc<dyn LockBackend> = match settings.backend {
            LockBackendKind::Memory => Arc::new(InMemoryLockBackend::new()),
            LockBackendKind::Postgres => Arc::new(PostgresAdvisoryLockBackend::new(pool.clone())),
            #[cfg(feature = "redis")]
            LockBackendKind::Redis => Arc::new(
                RedisLockBackend::new(&settings.redis_url)
                    .map_err(|e| ConfigError::Invalid {
                        key: "REDIS_URL",
                        value: e.to_string(),
                    })?
                    .with_ttl(settings.redis_ttl),
            ),
            #[cfg(not(feature = "redis"))]
            LockBackendKind::Redis => {
                return Err(ConfigError::Invalid {
                    key: "LOCK_BACKEND",
                    value: "redis (built without the redis feature)".to_string(),
                });
            }
        };
        debug!(backend = ?settings.backend, "store lock backend selected");
        Ok(Self::new(backend))
    }

    /// Run `f` while holding the lock for `store_code`.
    ///
    /// Returns `Skipped` immediately when the lock is held elsewhere; never
    /// waits for it to free up.
    pub async fn with_tenant_lock<T, F, Fut>(&self, store_code: &StoreCode, f: F) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.backend.try_acquire(store_code).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(store_code = %store_code, "store lock held elsewhere, skipping");
                return LockOutcome::Skipped;
            }
            Err(err) => {
                warn!(store_code = %store_code, error = %err, "store lock backend failed");
                return LockOutcome::Unavailable(err);
            }
        }

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(err) = self.backend.release(store_code).await {
            error!(store_code = %store_code, error = %err, "failed to release store lock");
        }

        match outcome {
            Ok(value) => LockOutcome::Ran(value),
            Err(payload) => {
                let message = crate::panic::describe(payload.as_ref());
                error!(store_code = %store_code, panic = %message, "store lock holder panicked");
                LockOutcome::Panicked(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn code(s: &str) -> StoreCode {
        StoreCode::new(s).unwrap()
    }

    /// Backend whose coordination store is down.
    struct BrokenBackend;

    #[async_trait]
    impl LockBackend for BrokenBackend {
        async fn try_acquire(&self, _store_code: &StoreCode) -> Result<bool, LockError> {
            Err(LockError::Unreachable("connection refused".to_string()))
        }

        async fn release(&self, _store_code: &StoreCode) -> Result<(), LockError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_closure_and_releases() {
        let locks = TenantLockManager::in_memory();
        let store = code("shop-1");

        let outcome = locks
            .with_tenant_lock(&store, || async { Ok::<_, String>(7) })
            .await;
        assert_eq!(outcome, LockOutcome::Ran(Ok(7)));

        let again = locks.with_tenant_lock(&store, || async { 8 }).await;
        assert_eq!(again, LockOutcome::Ran(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_calls_for_same_store_run_exactly_once() {
        let locks = TenantLockManager::in_memory();
        let store = code("shop-1");
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |locks: TenantLockManager, store: StoreCode, calls: Arc<AtomicUsize>| async move {
            locks
                .with_tenant_lock(&store, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(locks.clone(), store.clone(), calls.clone()),
            run(locks.clone(), store.clone(), calls.clone()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!([&a, &b].into_iter().filter(|o| matches!(o, LockOutcome::Skipped)).count(), 1);
    }

    #[tokio::test]
    async fn different_stores_do_not_contend() {
        let locks = TenantLockManager::in_memory();
        let a = code("shop-a");
        let b = code("shop-b");

        let outcome = locks
            .with_tenant_lock(&a, || async {
                locks.with_tenant_lock(&b, || async { "inner" }).await
            })
            .await;

        assert_eq!(outcome, LockOutcome::Ran(LockOutcome::Ran("inner")));
    }

    #[tokio::test]
    async fn error_result_still_releases_lock() {
        let locks = TenantLockManager::in_memory();
        let store = code("shop-1");

        let failed = locks
            .with_tenant_lock(&store, || async { Err::<(), _>("upstream down") })
            .await;
        assert_eq!(failed, LockOutcome::Ran(Err("upstream down")));

        let next = locks.with_tenant_lock(&store, || async {}).await;
        assert_eq!(next, LockOutcome::Ran(()));
    }

    #[tokio::test]
    async fn panic_is_captured_and_lock_released() {
        let locks = TenantLockManager::in_memory();
        let store = code("shop-1");

        let outcome: LockOutcome<()> = locks
            .with_tenant_lock(&store, || async { panic!("sync blew up") })
            .await;
        assert!(matches!(outcome, LockOutcome::Panicked(ref m) if m.contains("sync blew up")));

        let next = locks.with_tenant_lock(&store, || async { 1 }).await;
        assert_eq!(next, LockOutcome::Ran(1));
    }

    #[tokio::test]
    async fn backend_failure_is_not_a_skip() {
        let locks = TenantLockManager::new(Arc::new(BrokenBackend));
        let invoked = AtomicUsize::new(0);

        let outcome = locks
            .with_tenant_lock(&code("shop-1"), || async {
                invoked.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(outcome, LockOutcome::Unavailable(LockError::Unreachable(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn memory_backend_from_settings() {
        let pool = PgPool::connect_lazy("postgres://localhost/metricsync").unwrap();
        let settings = LockSettings {
            backend: LockBackendKind::Memory,
            ..LockSettings::default()
        };

        let locks = TenantLockManager::from_settings(&settings, &pool).unwrap();
        let outcome = locks.with_tenant_lock(&code("shop-1"), || async { 1 }).await;
        assert_eq!(outcome, LockOutcome::Ran(1));
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_backend_requires_feature() {
        let pool = PgPool::connect_lazy("postgres://localhost/metricsync").unwrap();
        let settings = LockSettings {
            backend: LockBackendKind::Redis,
            ..LockSettings::default()
        };
        assert!(TenantLockManager::from_settings(&settings, &pool).is_err());
    }
}
