//! Store account registry port.
//!
//! The registry owns store accounts. The sync core lists eligible stores,
//! flags accounts whose credential stopped working, and records refreshed
//! credentials.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use metricsync_core::{ConnectionStatus, Credential, StoreAccount, StoreCode};

pub mod postgres;

pub use postgres::PostgresAccountRegistry;

/// Account registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("store account not found: {0}")]
    NotFound(StoreCode),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    /// Accounts eligible for the daily sync.
    async fn list_connected(&self) -> Result<Vec<StoreAccount>, RegistryError>;

    /// Connected accounts whose credential expires within `horizon` from now.
    async fn list_expiring_within(
        &self,
        horizon: Duration,
    ) -> Result<Vec<StoreAccount>, RegistryError>;

    async fn set_status(
        &self,
        store_code: &StoreCode,
        status: ConnectionStatus,
    ) -> Result<(), RegistryError>;

    /// Persist a refreshed credential and mark the account connected.
    async fn save_credential(
        &self,
        store_code: &StoreCode,
        credential: &Credential,
    ) -> Result<(), RegistryError>;
}

#[async_trait]
impl<R> AccountRegistry for Arc<R>
where
    R: AccountRegistry + ?Sized,
{
    async fn list_connected(&self) -> Result<Vec<StoreAccount>, RegistryError> {
        (**self).list_connected().await
    }

    async fn list_expiring_within(
        &self,
        horizon: Duration,
    ) -> Result<Vec<StoreAccount>, RegistryError> {
        (**self).list_expiring_within(horizon).await
    }

    async fn set_status(
        &self,
        store_code: &StoreCode,
        status: ConnectionStatus,
    ) -> Result<(), RegistryError> {
        (**self).set_status(store_code, status).await
    }

    async fn save_credential(
        &self,
        store_code: &StoreCode,
        credential: &Credential,
    ) -> Result<(), RegistryError> {
        (**self).save_credential(store_code, credential).await
    }
}

#[derive(Debug, Clone)]
struct AccountRecord {
    account: StoreAccount,
    encrypted_token: Option<String>,
}

/// In-memory registry for tests/dev.
///
/// Listing order is by store code, which keeps test expectations stable.
#[derive(Debug, Default)]
pub struct InMemoryAccountRegistry {
    accounts: RwLock<BTreeMap<StoreCode, AccountRecord>>,
}

impl InMemoryAccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, account: StoreAccount) {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        accounts.insert(
            account.store_code.clone(),
            AccountRecord {
                account,
                encrypted_token: None,
            },
        );
    }

    pub fn get(&self, store_code: &StoreCode) -> Option<StoreAccount> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(store_code).map(|r| r.account.clone())
    }

    /// Stored encrypted token, for assertions in tests.
    pub fn stored_token(&self, store_code: &StoreCode) -> Option<String> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(store_code).and_then(|r| r.encrypted_token.clone())
    }

    fn expiring_at(&self, now: DateTime<Utc>, horizon: Duration) -> Vec<StoreAccount> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts
            .values()
            .map(|r| &r.account)
            .filter(|a| a.status == ConnectionStatus::Connected && a.expires_within(now, horizon))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AccountRegistry for InMemoryAccountRegistry {
    async fn list_connected(&self) -> Result<Vec<StoreAccount>, RegistryError> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(accounts
            .values()
            .map(|r| &r.account)
            .filter(|a| a.status == ConnectionStatus::Connected)
            .cloned()
            .collect())
    }

    async fn list_expiring_within(
        &self,
        horizon: Duration,
    ) -> Result<Vec<StoreAccount>, RegistryError> {
        Ok(self.expiring_at(Utc::now(), horizon))
    }

    async fn set_status(
        &self,
        store_code: &StoreCode,
        status: ConnectionStatus,
    ) -> Result<(), RegistryError> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        let record = accounts
            .get_mut(store_code)
            .ok_or_else(|| RegistryError::NotFound(store_code.clone()))?;
        record.account.status = status;
        Ok(())
    }

    async fn save_credential(
        &self,
        store_code: &StoreCode,
        credential: &Credential,
    ) -> Result<(), RegistryError> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        let record = accounts
            .get_mut(store_code)
            .ok_or_else(|| RegistryError::NotFound(store_code.clone()))?;
        record.encrypted_token = Some(credential.expose_token().to_string());
        record.account.credential_expires_at = Some(credential.expires_at);
        record.account.status = ConnectionStatus::Connected;
        Ok(())
    }
}
