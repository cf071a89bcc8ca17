//! Error types for the request pipeline.
//!
//! Every failure a caller can observe is one [`Error`] variant, and every variant maps
//! onto exactly one [`ErrorKind`]. Raw transport failures never leak through
//! unclassified: they arrive wrapped as [`Error::Network`] or [`Error::Timeout`].

use crate::middleware::Stage;
use crate::request::RequestDescriptor;
use crate::transport::TransportError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Boxed error type returned by middleware and store backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for pipeline calls.
///
/// # Examples
///
/// ```no_run
/// use waypost::{Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/pokemon/25").await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(Error::HttpStatus { status, body, .. }) => {
///         eprintln!("HTTP error {}: {:?}", status, body);
///     }
///     Err(Error::Cancelled) => eprintln!("request was cancelled"),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No response was received (DNS failure, refused connection, reset, ...).
    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    /// An attempt did not complete within the configured timeout.
    ///
    /// Timeouts are network-level failures and are eligible for retry.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A response was received but its status is outside the 2xx range.
    #[error("HTTP error {status}")]
    HttpStatus {
        /// The HTTP status code
        status: StatusCode,
        /// The response headers
        headers: HeaderMap,
        /// The raw response body
        body: Bytes,
    },

    /// The `only-cache` strategy found nothing stored under the key.
    #[error("Not found in cache: {key}")]
    CacheMiss {
        /// The cache key that was looked up
        key: String,
    },

    /// A middleware failed while processing its stage.
    ///
    /// `cause` holds the error that was being handled when an error-stage middleware
    /// itself failed, so the original diagnosis is not lost.
    #[error("{stage} middleware failed: {source}")]
    Middleware {
        /// The stage the failing middleware was registered on
        stage: Stage,
        /// What the middleware raised
        source: BoxError,
        /// The error being processed when the middleware failed, if any
        cause: Option<Box<Error>>,
    },

    /// The cancellation signal passed with the request fired.
    #[error("Request was cancelled")]
    Cancelled,

    /// Failed to deserialize the response body into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Classification tag of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response received.
    Network,
    /// The attempt exceeded its timeout.
    Timeout,
    /// Non-2xx status received.
    HttpStatus,
    /// Nothing cached under `only-cache`.
    CacheMiss,
    /// A middleware raised.
    Middleware,
    /// Cancellation signal observed.
    Cancelled,
    /// Body did not match the expected type.
    Deserialization,
    /// Bad setup or request construction.
    Configuration,
}

impl Error {
    /// Returns the classification tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::HttpStatus { .. } => ErrorKind::HttpStatus,
            Error::CacheMiss { .. } => ErrorKind::CacheMiss,
            Error::Middleware { .. } => ErrorKind::Middleware,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeserializationFailed { .. } => ErrorKind::Deserialization,
            Error::ConfigurationError(_) | Error::InvalidUrl(_) => ErrorKind::Configuration,
        }
    }

    /// Returns `true` if no response was received: connection failures and timeouts.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use waypost::Error;
    ///
    /// assert!(Error::Timeout(Duration::from_secs(5)).is_network());
    /// assert!(!Error::Cancelled.is_network());
    /// ```
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpStatus { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the response headers if a response was received.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            Error::HttpStatus { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// Returns the raw response body as text if this error has one.
    pub fn raw_response(&self) -> Option<String> {
        match self {
            Error::HttpStatus { body, .. } => Some(String::from_utf8_lossy(body).into_owned()),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response.clone()),
            _ => None,
        }
    }
}

/// An error travelling through the error-stage middleware.
///
/// Carries the classified [`Error`] together with the request that produced it, so
/// error middleware can decide based on method, URL or status.
#[derive(Debug)]
pub struct ErrorContext {
    /// The classified failure.
    pub error: Error,
    /// The request that failed, as it was dispatched.
    pub request: Arc<RequestDescriptor>,
    /// How many transport attempts were made (0 if none were).
    pub attempts: u32,
}

impl ErrorContext {
    /// Creates a new context for `error` raised while serving `request`.
    pub fn new(error: Error, request: Arc<RequestDescriptor>, attempts: u32) -> Self {
        Self {
            error,
            request,
            attempts,
        }
    }

    /// Returns the classification tag of the carried error.
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Returns the offending status code, if a response was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.error.status()
    }

    /// Discards the context and returns the error.
    pub fn into_error(self) -> Error {
        self.error
    }
}

/// A specialized `Result` type for pipeline calls.
pub type Result<T> = std::result::Result<T, Error>;
