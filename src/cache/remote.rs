//! Redis-backed cache store.

use super::store::{CacheEntry, CacheStore, CachedResponse, StoreError};
use super::strategy::RemoteStoreConfig;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::trace;

/// [`CacheStore`] that keeps entries in Redis.
///
/// Entries are stored as JSON under `{key_prefix}{key}` with a millisecond
/// expiry, so Redis enforces the TTL. The connection is opened lazily on first
/// use and shared by all requests.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
}

impl RedisStore {
    /// Creates a store for the given connection parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection URL is malformed. No connection is made
    /// until the first operation.
    pub fn new(config: &RemoteStoreConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| {
                trace!("Initialize new redis connection manager");
                self.client.get_connection_manager()
            })
            .await
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        Ok(manager.clone())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut con = self.connection().await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut con)
            .await
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;

        match raw {
            Some(raw) => {
                let entry: CacheEntry = serde_json::from_slice(&raw)?;
                Ok((!entry.is_expired()).then_some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: CachedResponse, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.connection().await?;
        let payload = serde_json::to_vec(&CacheEntry::new(key, value, ttl))?;
        // PX 0 is rejected by redis
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut con)
            .await
            .map_err(|e| StoreError::Unavailable(Box::new(e)))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut con = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut con)
            .await
            .map_err(|e| StoreError::Unavailable(Box::new(e)))?;
        Ok(deleted > 0)
    }
}
