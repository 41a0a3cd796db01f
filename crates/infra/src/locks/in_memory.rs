//! Process-local lock backend.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use metricsync_core::StoreCode;

use super::{LockBackend, LockError};

/// In-memory lock table for tests/dev and single-process deployments.
///
/// Only visible inside this process; use the Postgres or Redis backend when
/// several workers may sync the same stores.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    held: Mutex<HashSet<StoreCode>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock for `store_code` is currently held.
    pub fn is_held(&self, store_code: &StoreCode) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(store_code)
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, store_code: &StoreCode) -> Result<bool, LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(held.insert(store_code.clone()))
    }

    async fn release(&self, store_code: &StoreCode) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(store_code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let backend = InMemoryLockBackend::new();
        let store = StoreCode::new("shop-1").unwrap();

        assert!(backend.try_acquire(&store).await.unwrap());
        assert!(backend.is_held(&store));
        assert!(!backend.try_acquire(&store).await.unwrap());

        backend.release(&store).await.unwrap();
        assert!(!backend.is_held(&store));
        assert!(backend.try_acquire(&store).await.unwrap());
    }
}
