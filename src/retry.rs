//! Retry policy evaluation for transient failures.
//!
//! A [`RetryPolicy`] decides whether a failed attempt should be tried again and how
//! long to wait first. Each attempt is a full transport invocation, and the attempt
//! counter belongs to a single logical request.

use crate::config::{Merge, RetryOverrides};
use crate::transport::TransportError;
use crate::Error;
use http::{HeaderMap, Method};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A delay function keyed by attempt number (1 = delay before the second attempt).
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Delay schedule between attempts.
///
/// # Examples
///
/// ```
/// use waypost::retry::Backoff;
/// use std::time::Duration;
///
/// // 100ms, 200ms, 400ms, ... capped at 10s
/// let exponential = Backoff::Exponential {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
///     jitter: false,
/// };
/// assert_eq!(exponential.delay_for(3), Duration::from_millis(400));
///
/// let fixed = Backoff::Fixed(Duration::from_secs(1));
/// assert_eq!(fixed.delay_for(7), Duration::from_secs(1));
/// ```
#[derive(Clone)]
pub enum Backoff {
    /// Wait `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    ///
    /// With `jitter`, the delay is scaled by a random factor between 0.5 and 1.0.
    Exponential {
        /// The delay before the first retry.
        initial_delay: Duration,
        /// The maximum delay between retries.
        max_delay: Duration,
        /// Whether to add random jitter to delays.
        jitter: bool,
    },

    /// The same delay before every retry.
    Fixed(Duration),

    /// A caller-supplied function of the attempt number.
    Custom(DelayFn),
}

impl Backoff {
    /// Wraps a delay function.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Backoff::Custom(Arc::new(f))
    }

    /// Returns the delay to wait after the `attempt`-th failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential {
                initial_delay,
                max_delay,
                jitter,
            } => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                let delay = initial_delay.saturating_mul(multiplier).min(*max_delay);
                if *jitter {
                    let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
                    delay.mul_f64(jitter_factor)
                } else {
                    delay
                }
            }
            Backoff::Fixed(delay) => *delay,
            Backoff::Custom(delay_fn) => delay_fn(attempt),
        }
    }

    /// Returns the largest delay this schedule can produce, if bounded.
    pub fn max_delay(&self) -> Option<Duration> {
        match self {
            Backoff::Exponential { max_delay, .. } => Some(*max_delay),
            Backoff::Fixed(delay) => Some(*delay),
            Backoff::Custom(_) => None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential {
                initial_delay,
                max_delay,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("initial_delay", initial_delay)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            Backoff::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Trait for determining whether a failed request should be retried.
///
/// A predicate installed on a [`RetryPolicy`] replaces the default condition
/// entirely. The attempt ceiling and cancellation still apply.
///
/// Closures of the form `Fn(&Error, u32) -> bool` implement this trait.
///
/// # Examples
///
/// ```
/// use waypost::{Error, RetryPredicate};
///
/// struct RetryOnRateLimit;
///
/// impl RetryPredicate for RetryOnRateLimit {
///     fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
///         error.status().map_or(false, |s| s.as_u16() == 429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if the request should be retried after `error`.
    ///
    /// `attempt` is the number of attempts made so far (1-indexed).
    fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&Error, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Retry only on 5xx server errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOn5xx;

impl RetryPredicate for RetryOn5xx {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::HttpStatus { status, .. } if status.is_server_error())
    }
}

/// Retry only on timeout errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTimeout;

impl RetryPredicate for RetryOnTimeout {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(
            error,
            Error::Timeout(_) | Error::Network(TransportError::Timeout)
        )
    }
}

/// Retry only on network/connection errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::Network(_))
    }
}

/// Combine multiple retry predicates with OR logic.
///
/// # Examples
///
/// ```
/// use waypost::retry::{OrPredicate, RetryOn5xx, RetryOnTimeout};
///
/// let predicate = OrPredicate::new(vec![Box::new(RetryOn5xx), Box::new(RetryOnTimeout)]);
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// Combine multiple retry predicates with AND logic.
pub struct AndPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl AndPredicate {
    /// Creates a new `AndPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for AndPredicate {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.predicates
            .iter()
            .all(|p| p.should_retry(error, attempt))
    }
}

/// Longest wait a `Retry-After` header can impose by default.
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Status codes retried by default.
pub const DEFAULT_RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// When and how to retry failed attempts.
///
/// The default policy makes at most 3 attempts, retries network failures and
/// timeouts for any method, and retries [`DEFAULT_RETRY_STATUSES`] for `GET`,
/// `HEAD`, `OPTIONS`, `DELETE` and `PUT`.
///
/// # Examples
///
/// ```
/// use waypost::RetryPolicy;
/// use waypost::retry::Backoff;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .max_attempts(5)
///     .backoff(Backoff::Fixed(Duration::from_millis(250)));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    statuses: Vec<u16>,
    methods: Vec<Method>,
    backoff: Backoff,
    predicate: Option<Arc<dyn RetryPredicate>>,
    respect_retry_after: bool,
    max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            methods: vec![
                Method::GET,
                Method::HEAD,
                Method::OPTIONS,
                Method::DELETE,
                Method::PUT,
            ],
            backoff: Backoff::default(),
            predicate: None,
            respect_retry_after: true,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("statuses", &self.statuses)
            .field("methods", &self.methods)
            .field("backoff", &self.backoff)
            .field("predicate", &self.predicate.is_some())
            .field("respect_retry_after", &self.respect_retry_after)
            .field("max_retry_after", &self.max_retry_after)
            .finish()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().max_attempts(1)
    }

    /// Sets the total number of attempts, including the first one.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the status codes eligible for retry.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Sets the methods whose status failures are eligible for retry.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Sets the delay schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the default retry condition with `predicate`.
    pub fn predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Sets whether a `Retry-After` header on the failed response sets the delay.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Caps the wait a `Retry-After` header can impose.
    ///
    /// The backoff schedule does not bound this wait.
    pub fn max_retry_after(mut self, max_wait: Duration) -> Self {
        self.max_retry_after = max_wait;
        self
    }

    /// Returns the attempt ceiling.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts
    }

    /// Returns this policy with the fields set in `overrides` replaced.
    pub fn with_overrides(&self, overrides: &RetryOverrides) -> Self {
        let base = RetryOverrides {
            max_attempts: Some(self.max_attempts),
            backoff: Some(self.backoff.clone()),
            statuses: Some(self.statuses.clone()),
            methods: Some(self.methods.clone()),
        };
        let RetryOverrides {
            max_attempts,
            backoff,
            statuses,
            methods,
        } = base.merge(overrides.clone());

        Self {
            max_attempts: max_attempts.unwrap_or(self.max_attempts),
            backoff: backoff.unwrap_or_else(|| self.backoff.clone()),
            statuses: statuses.unwrap_or_else(|| self.statuses.clone()),
            methods: methods.unwrap_or_else(|| self.methods.clone()),
            ..self.clone()
        }
    }

    /// Decides whether `attempt` (1-indexed) failing with `error` earns another try.
    ///
    /// Never retries once `attempt` reaches the ceiling, and never retries
    /// cancellations, cache misses, middleware or configuration failures.
    pub fn should_retry(&self, error: &Error, method: &Method, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if !matches!(
            error,
            Error::Network(_) | Error::Timeout(_) | Error::HttpStatus { .. }
        ) {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate.should_retry(error, attempt);
        }
        if error.is_network() {
            return true;
        }
        let status_retryable = error
            .status()
            .is_some_and(|status| self.statuses.contains(&status.as_u16()));
        status_retryable && method_in(method, &self.methods)
    }

    /// Returns how long to wait after the `attempt`-th failure.
    pub fn delay_for(&self, attempt: u32, error: &Error) -> Duration {
        if self.respect_retry_after {
            if let Some(retry_after) = error.headers().and_then(parse_retry_after) {
                return retry_after.min(self.max_retry_after);
            }
        }
        self.backoff.delay_for(attempt)
    }
}

/// Case-insensitive method membership.
pub(crate) fn method_in(method: &Method, methods: &[Method]) -> bool {
    methods
        .iter()
        .any(|m| m.as_str().eq_ignore_ascii_case(method.as_str()))
}

/// Parses the Retry-After header.
///
/// Supports both delay-seconds and HTTP-date formats.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    date_time.duration_since(SystemTime::now()).ok()
}
