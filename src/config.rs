//! Layered per-call configuration.
//!
//! Settings are resolved with the precedence call > route > global. Every
//! overridable field is an `Option`, where `None` means "not set at this layer" and
//! falls through to the layer below, so an explicit `Some(0)` or `Some(false)` is
//! never confused with an absent value.

use crate::cache::CacheStrategy;
use crate::retry::Backoff;
use http::Method;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Field-by-field layering of partial settings.
pub trait Merge {
    /// Returns `self` with every field that `higher` sets replaced by `higher`'s value.
    fn merge(self, higher: Self) -> Self;
}

/// Partial cache settings, as set by a route rule or a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOverrides {
    /// Strategy to use.
    pub strategy: Option<CacheStrategy>,
    /// Lifetime of entries written by this request.
    pub ttl: Option<Duration>,
    /// Methods allowed to read and write the cache.
    pub methods: Option<Vec<Method>>,
    /// A cache key used verbatim instead of the computed one.
    pub key: Option<String>,
}

impl CacheOverrides {
    /// Overrides the strategy.
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Overrides the TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Overrides the cacheable methods.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    /// Uses `key` verbatim as the cache key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl Merge for CacheOverrides {
    fn merge(self, higher: Self) -> Self {
        Self {
            strategy: higher.strategy.or(self.strategy),
            ttl: higher.ttl.or(self.ttl),
            methods: higher.methods.or(self.methods),
            key: higher.key.or(self.key),
        }
    }
}

/// Partial retry settings for a single call.
#[derive(Debug, Clone, Default)]
pub struct RetryOverrides {
    /// Total number of transport attempts, including the first.
    pub max_attempts: Option<u32>,
    /// Delay schedule between attempts.
    pub backoff: Option<Backoff>,
    /// Status codes eligible for retry.
    pub statuses: Option<Vec<u16>>,
    /// Methods eligible for retry.
    pub methods: Option<Vec<Method>>,
}

impl RetryOverrides {
    /// Disables retries for this call.
    pub fn disabled() -> Self {
        Self::default().max_attempts(1)
    }

    /// Overrides the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Overrides the delay schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Overrides the retryable status codes.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Overrides the retryable methods.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }
}

impl Merge for RetryOverrides {
    fn merge(self, higher: Self) -> Self {
        Self {
            max_attempts: higher.max_attempts.or(self.max_attempts),
            backoff: higher.backoff.or(self.backoff),
            statuses: higher.statuses.or(self.statuses),
            methods: higher.methods.or(self.methods),
        }
    }
}

/// Options a caller attaches to one request.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Retry overrides.
    pub retry: RetryOverrides,
    /// Cache overrides.
    pub cache: CacheOverrides,
    /// Timeout for each transport attempt.
    pub timeout: Option<Duration>,
    /// Signal that aborts the request when fired.
    pub cancellation: Option<CancellationToken>,
}
