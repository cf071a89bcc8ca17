//! Cache strategies, route rules and per-request resolution.

use super::key::compute_key;
use crate::config::{CacheOverrides, Merge};
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use crate::retry::method_in;
use crate::Error;
use http::Method;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the cache and the transport interact for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve from cache when possible; on a miss, fetch and store.
    #[default]
    CacheFirst,
    /// Always fetch and refresh the store, but answer with the previously cached
    /// value when one exists.
    SideCache,
    /// Serve from cache only; a miss is an error and nothing is fetched.
    OnlyCache,
    /// Never touch the cache.
    NoCache,
}

impl CacheStrategy {
    /// Returns `true` if this strategy looks up the store.
    pub fn reads(self) -> bool {
        !matches!(self, CacheStrategy::NoCache)
    }

    /// Returns `true` if this strategy writes fetched responses to the store.
    pub fn writes(self) -> bool {
        matches!(self, CacheStrategy::CacheFirst | CacheStrategy::SideCache)
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheStrategy::CacheFirst => "cache-first",
            CacheStrategy::SideCache => "side-cache",
            CacheStrategy::OnlyCache => "only-cache",
            CacheStrategy::NoCache => "no-cache",
        })
    }
}

/// What a route rule matches request paths against.
#[derive(Debug, Clone)]
pub enum RoutePattern {
    /// The path must equal this string.
    Exact(String),
    /// The regular expression must match somewhere in the path.
    Regex(Regex),
}

impl RoutePattern {
    /// Tests `path` against the pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RoutePattern::Exact(expected) => expected == path,
            RoutePattern::Regex(regex) => regex.is_match(path),
        }
    }
}

/// A pattern-scoped override of cache behaviour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use waypost::cache::{CacheStrategy, RouteRule};
///
/// let rule = RouteRule::new("/pokemon/.*")?
///     .strategy(CacheStrategy::SideCache)
///     .ttl(Duration::from_secs(3600));
/// assert!(rule.matches("/pokemon/25"));
/// # Ok::<(), waypost::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct RouteRule {
    pattern: RoutePattern,
    overrides: CacheOverrides,
}

impl RouteRule {
    /// Creates a rule whose pattern is a regular expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if the pattern does not compile.
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::ConfigurationError(format!("Invalid route pattern {:?}: {}", pattern, e))
        })?;
        Ok(Self::with_pattern(RoutePattern::Regex(regex)))
    }

    /// Creates a rule matching exactly one path.
    pub fn exact(path: impl Into<String>) -> Self {
        Self::with_pattern(RoutePattern::Exact(path.into()))
    }

    fn with_pattern(pattern: RoutePattern) -> Self {
        Self {
            pattern,
            overrides: CacheOverrides::default(),
        }
    }

    /// Sets the strategy for matching requests.
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.overrides.strategy = Some(strategy);
        self
    }

    /// Sets the TTL for matching requests.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.overrides.ttl = Some(ttl);
        self
    }

    /// Sets the cacheable methods for matching requests.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.overrides.methods = Some(methods.into_iter().collect());
        self
    }

    /// Tests `path` against this rule's pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches(path)
    }
}

/// Computes a cache key for a request.
pub type KeyFn = Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>;

/// Decides whether a fetched response may be stored.
pub type ShouldCacheFn = Arc<dyn Fn(&ResponseEnvelope) -> bool + Send + Sync>;

/// Parameters for a remote cache store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Prefix prepended to every key written to the store.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Global cache configuration.
///
/// Defaults: `cache-first`, 60 second TTL, only `GET` cacheable, only 2xx
/// responses stored, in-memory store of 10 000 entries.
#[derive(Clone)]
pub struct CacheSettings {
    strategy: CacheStrategy,
    ttl: Duration,
    methods: Vec<Method>,
    routes: Vec<RouteRule>,
    key_fn: Option<KeyFn>,
    should_cache: Option<ShouldCacheFn>,
    remote: Option<RemoteStoreConfig>,
    max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::CacheFirst,
            ttl: Duration::from_secs(60),
            methods: vec![Method::GET],
            routes: Vec::new(),
            key_fn: None,
            should_cache: None,
            remote: None,
            max_entries: 10_000,
        }
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("strategy", &self.strategy)
            .field("ttl", &self.ttl)
            .field("methods", &self.methods)
            .field("routes", &self.routes)
            .field("key_fn", &self.key_fn.is_some())
            .field("should_cache", &self.should_cache.is_some())
            .field("remote", &self.remote)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// The outcome of resolving a request against the cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Key to read and write.
    pub key: String,
    /// Effective strategy.
    pub strategy: CacheStrategy,
    /// Lifetime of a written entry.
    pub ttl: Duration,
    /// Index of the matching route rule, if any.
    pub route: Option<usize>,
}

impl CacheSettings {
    /// Settings that never cache.
    pub fn disabled() -> Self {
        Self::default().strategy(CacheStrategy::NoCache)
    }

    /// Sets the default strategy.
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the default TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the default cacheable methods.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Appends a route rule. Rules are tested in the order they were added.
    pub fn route(mut self, rule: RouteRule) -> Self {
        self.routes.push(rule);
        self
    }

    /// Replaces the default key computation.
    pub fn key_fn(mut self, f: impl Fn(&RequestDescriptor) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Replaces the default "2xx only" storage predicate.
    pub fn should_cache(
        mut self,
        f: impl Fn(&ResponseEnvelope) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_cache = Some(Arc::new(f));
        self
    }

    /// Uses a remote store instead of the in-memory one.
    pub fn remote(mut self, remote: RemoteStoreConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the capacity of the in-memory store.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Returns the remote store parameters, if configured.
    pub fn remote_config(&self) -> Option<&RemoteStoreConfig> {
        self.remote.as_ref()
    }

    /// Returns the in-memory store capacity.
    pub fn capacity(&self) -> u64 {
        self.max_entries
    }

    /// Returns `true` if `response` may be written to the store.
    pub fn is_storable(&self, response: &ResponseEnvelope) -> bool {
        match &self.should_cache {
            Some(predicate) => predicate(response),
            None => response.status.is_success(),
        }
    }

    /// Resolves key, strategy and TTL for `request`.
    ///
    /// `url` is the absolute request URL without query parameters. Route rules are
    /// matched against the request path; the first match wins. Call overrides
    /// beat the route, which beats these settings. A method outside the
    /// applicable cacheable set always resolves to [`CacheStrategy::NoCache`].
    pub fn resolve(&self, request: &RequestDescriptor, url: &str) -> Resolution {
        let path = request.path();
        let route = self.routes.iter().position(|rule| rule.matches(&path));
        let route_layer = route
            .and_then(|index| self.routes.get(index))
            .map(|rule| rule.overrides.clone())
            .unwrap_or_default();
        let layered = route_layer.merge(request.options.cache.clone());

        let methods = layered.methods.as_deref().unwrap_or(&self.methods);
        let strategy = if method_in(&request.method, methods) {
            layered.strategy.unwrap_or(self.strategy)
        } else {
            CacheStrategy::NoCache
        };

        let key = match (&layered.key, &self.key_fn) {
            (Some(key), _) => key.clone(),
            (None, Some(key_fn)) => key_fn(request),
            (None, None) => compute_key(
                &request.method,
                url,
                &request.query,
                request.body.as_ref(),
            ),
        };

        Resolution {
            key,
            strategy,
            ttl: layered.ttl.unwrap_or(self.ttl),
            route,
        }
    }
}
