//! Response envelopes and the typed response wrapper.
//!
//! [`ResponseEnvelope`] is what the pipeline produces: status, headers and body,
//! plus a back-reference to the request that produced it. [`Response`] wraps an
//! envelope whose body was deserialized into a caller type.

use crate::request::RequestDescriptor;
use crate::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Where a response came from, relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// The cache was not consulted (no-cache strategy or non-cacheable method).
    Bypass,
    /// The cache was consulted, nothing usable was stored, the network answered.
    Miss,
    /// The response was served from the cache.
    Hit,
}

/// A response travelling through the pipeline.
///
/// Envelopes are plain values: cloning one yields an independent copy, and the
/// cached form ([`CachedResponse`](crate::cache::CachedResponse)) holds no
/// connection handles.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The raw response body.
    pub body: Bytes,
    /// The request this response answers.
    pub request: Arc<RequestDescriptor>,
    /// Number of transport attempts made; 0 when served without the network.
    pub attempts: u32,
    /// Time from the start of the logical request until this envelope was produced.
    pub latency: Duration,
    /// Whether the cache served this response.
    pub cache_status: CacheStatus,
}

impl ResponseEnvelope {
    /// Creates an envelope answering `request`.
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        request: Arc<RequestDescriptor>,
    ) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            request,
            attempts: 0,
            latency: Duration::ZERO,
            cache_status: CacheStatus::Bypass,
        }
    }

    /// Creates an envelope with a JSON body and a matching `content-type`.
    ///
    /// Handy for error middleware that substitutes a fallback response.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use http::{Method, StatusCode};
    /// use waypost::{RequestDescriptor, ResponseEnvelope};
    ///
    /// let request = Arc::new(RequestDescriptor::new(Method::GET, "/pokemon/0"));
    /// let envelope = ResponseEnvelope::json(
    ///     StatusCode::OK,
    ///     serde_json::json!({ "found": false }),
    ///     request,
    /// );
    /// assert_eq!(envelope.text(), r#"{"found":false}"#);
    /// ```
    pub fn json(status: StatusCode, value: serde_json::Value, request: Arc<RequestDescriptor>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, value.to_string(), request)
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `true` if the cache served this response.
    pub fn is_cached(&self) -> bool {
        self.cache_status == CacheStatus::Hit
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns a header value by name, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] with the raw body preserved.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            tracing::error!(
                error = %e,
                raw_response = %self.text(),
                "Failed to deserialize response"
            );
            Error::DeserializationFailed {
                raw_response: self.text(),
                serde_error: e.to_string(),
                status: self.status,
            }
        })
    }
}

/// A successful response with its body deserialized.
///
/// # Examples
///
/// ```no_run
/// use waypost::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Pokemon {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), waypost::Error> {
/// let client = Client::builder()
///     .base_url("https://pokeapi.co/api/v2")?
///     .build()?;
///
/// let response = client.get::<Pokemon>("/pokemon/25").await?;
///
/// println!("Pokemon: {}", response.data.name);
/// println!("Request took {:?}", response.latency);
/// println!("Served from cache: {:?}", response.cache_status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The raw response body as a string.
    pub raw_body: String,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The total latency of the request, including all retry attempts.
    pub latency: Duration,

    /// The number of transport attempts made to complete this request.
    pub attempts: u32,

    /// Whether the cache served this response.
    pub cache_status: CacheStatus,
}

impl<T: DeserializeOwned> Response<T> {
    /// Deserializes an envelope's body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeserializationFailed`] if the body does not match `T`.
    pub fn from_envelope(envelope: ResponseEnvelope) -> Result<Self> {
        let data = envelope.json_body::<T>()?;
        Ok(Self {
            data,
            raw_body: envelope.text(),
            status: envelope.status,
            headers: envelope.headers,
            latency: envelope.latency,
            attempts: envelope.attempts,
            cache_status: envelope.cache_status,
        })
    }
}

impl<T> Response<T> {
    /// Maps the response data to a different type, keeping the metadata.
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
            cache_status: self.cache_status,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a reference to a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pokemon {
        id: u32,
        name: String,
    }

    fn request() -> Arc<RequestDescriptor> {
        Arc::new(RequestDescriptor::new(Method::GET, "/pokemon/25"))
    }

    #[test]
    fn test_typed_response_from_envelope() {
        let mut envelope = ResponseEnvelope::json(
            StatusCode::OK,
            serde_json::json!({ "id": 25, "name": "pikachu" }),
            request(),
        );
        envelope.attempts = 2;
        envelope.cache_status = CacheStatus::Miss;

        let response = Response::<Pokemon>::from_envelope(envelope).unwrap();
        assert_eq!(
            response.data,
            Pokemon {
                id: 25,
                name: "pikachu".to_string()
            }
        );
        assert!(response.was_retried());
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.map(|p| p.id).data, 25);
    }

    #[test]
    fn test_deserialization_failure_keeps_raw_body() {
        let envelope = ResponseEnvelope::new(StatusCode::OK, HeaderMap::new(), "not json", request());

        match Response::<Pokemon>::from_envelope(envelope) {
            Err(Error::DeserializationFailed {
                raw_response,
                status,
                ..
            }) => {
                assert_eq!(raw_response, "not json");
                assert_eq!(status, StatusCode::OK);
            }
            other => panic!("Expected DeserializationFailed, got {:?}", other),
        }
    }
}
