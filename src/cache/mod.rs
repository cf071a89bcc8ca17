//! Response caching: key generation, strategy resolution and storage backends.
//!
//! - [`CacheSettings`] holds the global policy and the ordered [`RouteRule`] list,
//!   and resolves each request to a [`Resolution`] (key, strategy, TTL).
//! - [`CacheStore`] is the narrow storage interface. [`MemoryStore`] is the
//!   in-process default; `RedisStore` is available with the `redis` feature.

mod key;
#[cfg(feature = "redis")]
mod remote;
mod store;
mod strategy;

pub use key::{compute_key, CIRCULAR_MARKER};
#[cfg(feature = "redis")]
pub use remote::RedisStore;
pub use store::{CacheEntry, CacheStore, CachedResponse, MemoryStore, StoreError};
pub use strategy::{
    CacheSettings, CacheStrategy, KeyFn, RemoteStoreConfig, Resolution, RoutePattern, RouteRule,
    ShouldCacheFn,
};
