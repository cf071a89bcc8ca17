//! Request descriptors: what a caller asks the pipeline to fetch.

use crate::config::{CacheOverrides, CallOptions, RetryOverrides};
use crate::Error;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::{form_urlencoded, Url};

/// A query parameter value.
///
/// Multiple values are serialized with the bracket convention:
/// `ids[]=1&ids[]=2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    /// A single `key=value` pair.
    Single(String),
    /// Repeated `key[]=value` pairs.
    Multiple(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Single(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Single(value)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(values: Vec<String>) -> Self {
        QueryValue::Multiple(values)
    }
}

impl From<Vec<&str>> for QueryValue {
    fn from(values: Vec<&str>) -> Self {
        QueryValue::Multiple(values.into_iter().map(str::to_string).collect())
    }
}

/// An opaque request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A JSON document, sent with `content-type: application/json`.
    Json(serde_json::Value),
    /// Plain text.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
}

/// Everything needed to perform one logical HTTP request.
///
/// Descriptors are values: middleware receives an owned copy and returns a new one,
/// so nothing another in-flight request can see is ever mutated.
///
/// # Examples
///
/// ```
/// use waypost::RequestDescriptor;
/// use http::Method;
///
/// let request = RequestDescriptor::new(Method::GET, "/pokemon")
///     .with_query_param("limit", "20")
///     .with_query_param("types", vec!["fire", "water"]);
///
/// assert_eq!(
///     request.query_string().as_deref(),
///     Some("limit=20&types[]=fire&types[]=water")
/// );
/// ```
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// The HTTP method (GET, POST, etc.).
    pub method: Method,

    /// An absolute URL, or a path relative to the client's base URL.
    pub url: String,

    /// Request headers. Lookups are case-insensitive.
    pub headers: HeaderMap,

    /// Query parameters, in insertion order.
    pub query: Vec<(String, QueryValue)>,

    /// Optional payload.
    pub body: Option<Body>,

    /// Per-call overrides of retry, cache and timeout settings.
    pub options: CallOptions,
}

impl RequestDescriptor {
    /// Creates a new descriptor with the given method and URL.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            options: CallOptions::default(),
        }
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, Error> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Appends a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Appends multiple query parameters to the request.
    pub fn with_query_params(
        mut self,
        params: impl IntoIterator<Item = (String, QueryValue)>,
    ) -> Self {
        self.query.extend(params);
        self
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes `body` to JSON and sets it as the request body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if `body` cannot be represented as JSON.
    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, Error> {
        let value = serde_json::to_value(body)
            .map_err(|e| Error::ConfigurationError(format!("Failed to serialize body: {}", e)))?;
        Ok(self.with_body(Body::Json(value)))
    }

    /// Replaces all per-call options.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the timeout of each attempt for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Overrides cache behaviour for this call.
    pub fn with_cache(mut self, cache: CacheOverrides) -> Self {
        self.options.cache = cache;
        self
    }

    /// Overrides retry behaviour for this call.
    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.options.retry = retry;
        self
    }

    /// Attaches a cancellation signal to this call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancellation = Some(token);
        self
    }

    /// Returns the encoded query string, or `None` when there are no parameters.
    ///
    /// Brackets of multi-valued keys are left unescaped; everything else is
    /// form-urlencoded.
    pub fn query_string(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        let mut pairs = Vec::new();
        for (key, value) in &self.query {
            let key = encode(key);
            match value {
                QueryValue::Single(v) => pairs.push(format!("{}={}", key, encode(v))),
                QueryValue::Multiple(values) => {
                    pairs.extend(values.iter().map(|v| format!("{}[]={}", key, encode(v))))
                }
            }
        }
        Some(pairs.join("&"))
    }

    /// Returns the path portion of the URL, without query or fragment.
    ///
    /// Route rules are matched against this value.
    pub fn path(&self) -> String {
        if let Ok(url) = Url::parse(&self.url) {
            return url.path().to_string();
        }
        let end = self.url.find(['?', '#']).unwrap_or(self.url.len());
        self.url[..end].to_string()
    }

    /// Builds the absolute URL for this request, without its query parameters.
    ///
    /// A relative URL is appended to `base` with exactly one `/` between them, so a
    /// base path such as `https://host/api/v2` is preserved. A query string already
    /// present in [`url`](Self::url) is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is relative and no base is configured, or if the
    /// result does not parse.
    pub fn target_url(&self, base: Option<&Url>) -> Result<Url, Error> {
        match Url::parse(&self.url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = base.ok_or_else(|| {
                    Error::ConfigurationError(format!(
                        "Relative URL {:?} requires a base URL",
                        self.url
                    ))
                })?;
                let joined = format!(
                    "{}/{}",
                    base.as_str().trim_end_matches('/'),
                    self.url.trim_start_matches('/')
                );
                Ok(Url::parse(&joined)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Builds the absolute URL for this request, including its query parameters.
    ///
    /// # Errors
    ///
    /// See [`target_url`](Self::target_url).
    pub fn resolve_url(&self, base: Option<&Url>) -> Result<Url, Error> {
        let mut url = self.target_url(base)?;
        if let Some(query) = self.query_string() {
            let combined = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{}&{}", existing, query),
                _ => query,
            };
            url.set_query(Some(&combined));
        }
        Ok(url)
    }
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self::new(Method::GET, "")
    }
}

fn encode(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_query_serialization() {
        let request = RequestDescriptor::new(Method::GET, "/search")
            .with_query_param("q", "mr mime")
            .with_query_param("ids", vec!["1", "2"]);

        assert_eq!(
            request.query_string().as_deref(),
            Some("q=mr+mime&ids[]=1&ids[]=2")
        );
        assert_eq!(RequestDescriptor::default().query_string(), None);
    }

    #[test]
    fn test_resolve_relative_url_keeps_base_path() {
        let base = Url::parse("https://pokeapi.co/api/v2/").unwrap();
        let request = RequestDescriptor::new(Method::GET, "/pokemon/25").with_query_param("x", "1");

        let url = request.resolve_url(Some(&base)).unwrap();
        assert_eq!(url.as_str(), "https://pokeapi.co/api/v2/pokemon/25?x=1");
        let target = request.target_url(Some(&base)).unwrap();
        assert_eq!(target.as_str(), "https://pokeapi.co/api/v2/pokemon/25");
    }

    #[test]
    fn test_resolve_absolute_url_merges_query() {
        let request = RequestDescriptor::new(Method::GET, "https://example.com/a?b=1")
            .with_query_param("c", "2");

        let url = request.resolve_url(None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?b=1&c=2");
        assert_eq!(request.path(), "/a");
    }

    #[test]
    fn test_relative_url_without_base_is_rejected() {
        let request = RequestDescriptor::new(Method::GET, "/pokemon");
        assert!(matches!(
            request.resolve_url(None),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_path_strips_query() {
        let request = RequestDescriptor::new(Method::GET, "/pokemon/25?form=alola");
        assert_eq!(request.path(), "/pokemon/25");
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = RequestDescriptor::new(Method::GET, "/")
            .with_header("X-Trace-Id", "abc")
            .unwrap();
        assert_eq!(request.headers.get("x-trace-id").unwrap(), "abc");
    }
}
