//! Cache storage: the [`CacheStore`] trait, its entry types and the in-memory store.

use crate::error::BoxError;
use crate::request::RequestDescriptor;
use crate::response::{CacheStatus, ResponseEnvelope};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// A detached snapshot of a response, safe to store and share.
///
/// Holds only owned data: no connection handles, streams or back-references.
/// Header values that are not valid UTF-8 are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The response headers, in order.
    pub headers: Vec<(String, String)>,
    /// The response body.
    pub body: Bytes,
    /// Method of the request that produced the response.
    pub method: String,
    /// URL of the request that produced the response.
    pub url: String,
}

impl CachedResponse {
    /// Takes a snapshot of `envelope`.
    pub fn from_envelope(envelope: &ResponseEnvelope) -> Self {
        let headers = envelope
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: envelope.status.as_u16(),
            headers,
            body: envelope.body.clone(),
            method: envelope.request.method.to_string(),
            url: envelope.request.url.clone(),
        }
    }

    /// Rebuilds an envelope answering `request` from this snapshot.
    ///
    /// Returns `None` if the stored status is not a valid HTTP status code.
    pub fn to_envelope(&self, request: Arc<RequestDescriptor>) -> Option<ResponseEnvelope> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let mut envelope = ResponseEnvelope::new(status, headers, self.body.clone(), request);
        envelope.cache_status = CacheStatus::Hit;
        Some(envelope)
    }
}

/// A stored response with its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The key the entry is stored under.
    pub key: String,
    /// The stored response.
    pub value: CachedResponse,
    /// How long the entry lives after creation.
    pub ttl: Duration,
    /// When the entry was written.
    pub created_at: SystemTime,
}

impl CacheEntry {
    /// Creates an entry written now.
    pub fn new(key: impl Into<String>, value: CachedResponse, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
            created_at: SystemTime::now(),
        }
    }

    /// Returns `true` once the TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        match self.created_at.elapsed() {
            Ok(age) => age >= self.ttl,
            // clock went backwards; the entry is younger than "now"
            Err(_) => false,
        }
    }
}

/// Errors raised by a cache backend.
///
/// The pipeline never surfaces these to callers: a failed read is a miss and a
/// failed write is skipped.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("cache backend unavailable: {0}")]
    Unavailable(#[source] BoxError),

    /// A stored entry could not be encoded or decoded.
    #[error("cache entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key-value storage with per-entry TTL.
///
/// Backends are responsible for their own concurrency safety; the pipeline calls
/// them without holding any lock.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Looks up `key`. Expired entries are reported as missing.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    async fn set(&self, key: &str, value: CachedResponse, ttl: Duration) -> Result<(), StoreError>;

    /// Removes `key`. Returns `true` if an entry was present.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process [`CacheStore`] backed by a bounded moka cache.
///
/// Each entry expires after its own TTL. Data is not persisted and not shared
/// across processes.
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, CacheEntry>,
}

impl MemoryStore {
    /// Creates a store holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryTtl)
            .build();
        Self { cache }
    }

    /// Returns the approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.cache.get(key).await.filter(|entry| !entry.is_expired()))
    }

    async fn set(&self, key: &str, value: CachedResponse, ttl: Duration) -> Result<(), StoreError> {
        tracing::debug!(cache_key = key, ttl_ms = ttl.as_millis() as u64, "Cache store");
        self.cache
            .insert(key.to_string(), CacheEntry::new(key, value, ttl))
            .await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn snapshot(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from_static(body.as_bytes()),
            method: "GET".into(),
            url: "/pokemon/25".into(),
        }
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new(100);
        assert!(store.get("k").await.unwrap().is_none());

        store
            .set("k", snapshot("{}"), Duration::from_secs(60))
            .await
            .unwrap();
        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.key, "k");
        assert_eq!(entry.value, snapshot("{}"));

        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire_after_their_own_ttl() {
        let store = MemoryStore::new(100);
        store
            .set("short", snapshot("1"), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .set("long", snapshot("2"), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[test]
    fn test_snapshot_round_trip_through_envelope() {
        let request = Arc::new(RequestDescriptor::new(Method::GET, "/pokemon/25"));
        let original = snapshot(r#"{"id":25}"#);

        let envelope = original.to_envelope(request).unwrap();
        assert_eq!(envelope.cache_status, CacheStatus::Hit);
        assert_eq!(envelope.header("content-type"), Some("application/json"));
        assert_eq!(CachedResponse::from_envelope(&envelope), original);
    }

    #[test]
    fn test_invalid_stored_status_is_rejected() {
        let request = Arc::new(RequestDescriptor::new(Method::GET, "/pokemon/25"));
        let mut corrupt = snapshot("x");
        corrupt.status = 42;
        assert!(corrupt.to_envelope(request.clone()).is_none());

        corrupt.status = 1000;
        assert!(corrupt.to_envelope(request).is_none());
    }

    #[test]
    fn test_entry_serializes_for_remote_stores() {
        let entry = CacheEntry::new("k", snapshot("x"), Duration::from_secs(5));
        let json = serde_json::to_vec(&entry).unwrap();
        let decoded: CacheEntry = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.value, entry.value);
        assert_eq!(decoded.ttl, entry.ttl);
        assert!(!decoded.is_expired());
    }
}
