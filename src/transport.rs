//! The transport capability: the component that performs the literal network call.
//!
//! The pipeline never talks to sockets directly. It hands a resolved URL and a
//! [`RequestDescriptor`] to a [`Transport`] and gets back either a [`RawResponse`]
//! (for any status code) or a [`TransportError`] meaning no response was received.

use crate::error::BoxError;
use crate::request::{Body, RequestDescriptor};
use crate::Error;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use url::Url;

/// A response as received from the wire, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The full response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a response with empty headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A failure to obtain any response.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The connection could not be established (DNS, refused, TLS handshake, ...).
    #[error("connection failed: {0}")]
    Connect(#[source] BoxError),

    /// The transport's own timeout elapsed.
    #[error("transport timed out")]
    Timeout,

    /// The exchange broke off after the connection was established.
    #[error("request failed: {0}")]
    Request(#[source] BoxError),
}

/// Performs one HTTP exchange.
///
/// Implementations report every received status code as `Ok`; only the absence of
/// a response is an `Err`. They must be safe to call concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` to `url` and returns the complete response.
    async fn send(
        &self,
        url: Url,
        request: &RequestDescriptor,
    ) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, Error> {
        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { http_client })
    }

    /// Wraps an already configured `reqwest` client.
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        url: Url,
        request: &RequestDescriptor,
    ) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .http_client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());

        match &request.body {
            Some(Body::Json(value)) => builder = builder.json(value),
            Some(Body::Text(text)) => {
                if !request.headers.contains_key(CONTENT_TYPE) {
                    builder = builder.header(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    );
                }
                builder = builder.body(text.clone());
            }
            Some(Body::Bytes(bytes)) => builder = builder.body(bytes.clone()),
            None => {}
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(Box::new(error))
    } else {
        TransportError::Request(Box::new(error))
    }
}
