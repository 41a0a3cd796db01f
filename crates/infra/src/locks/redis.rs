//! Redis-backed lock backend (cross-process, TTL-bounded).
//!
//! - **Acquire**: `SET <key> <token> NX PX <ttl>`; a nil reply means the lock is held
//! - **Release**: compare-and-delete via Lua, so a holder whose TTL already
//!   expired can never delete a lock re-taken by someone else
//! - **TTL**: bounds how long a crashed holder can block a store

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};
use uuid::Uuid;

use metricsync_core::StoreCode;

use super::{LockBackend, LockError};

/// Default key prefix for store locks.
const DEFAULT_KEY_PREFIX: &str = "metricsync:lock:store";

/// Default lock TTL (longer than any sane single-store sync)
const DEFAULT_TTL: Duration = Duration::from_secs(900);

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockBackend {
    client: Arc<redis::Client>,
    key_prefix: String,
    ttl: Duration,
    tokens: Arc<Mutex<HashMap<StoreCode, String>>>,
}

impl RedisLockBackend {
    /// Create a backend for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Unreachable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, store_code: &StoreCode) -> String {
        format!("{}:{}", self.key_prefix, store_code)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    #[instrument(skip(self), fields(store_code = %store_code), err)]
    async fn try_acquire(&self, store_code: &StoreCode) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let token = Uuid::now_v7().to_string();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(store_code))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if reply.is_none() {
            return Ok(false);
        }

        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(store_code.clone(), token);
        Ok(true)
    }

    #[instrument(skip(self), fields(store_code = %store_code), err)]
    async fn release(&self, store_code: &StoreCode) -> Result<(), LockError> {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(store_code);
        let Some(token) = token else {
            return Ok(());
        };

        let mut conn = self.connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(store_code))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if deleted == 0 {
            warn!(store_code = %store_code, "store lock expired before release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefix_and_store() {
        let backend = RedisLockBackend::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_key_prefix("test:lock");
        let store = StoreCode::new("shop-1").unwrap();
        assert_eq!(backend.key(&store), "test:lock:shop-1");
    }

    #[test]
    fn invalid_url_is_unreachable() {
        assert!(matches!(
            RedisLockBackend::new("not a url"),
            Err(LockError::Unreachable(_))
        ));
    }
}
