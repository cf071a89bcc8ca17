//! The request pipeline.
//!
//! The [`Client`] type is the main entry point for making HTTP requests.
//! Use [`ClientBuilder`] to configure and create clients.
//!
//! A logical request moves through these stages:
//!
//! 1. request middleware
//! 2. cache resolution and lookup
//! 3. dispatch through the [`Transport`], with retries
//! 4. cache write
//! 5. response middleware, or error middleware if anything above failed

use crate::cache::{
    CacheSettings, CacheStore, CacheStrategy, CachedResponse, MemoryStore, Resolution,
};
use crate::error::ErrorContext;
use crate::middleware::{
    ErrorMiddleware, MiddlewareChain, RequestMiddleware, ResponseMiddleware, Stage,
};
use crate::request::RequestDescriptor;
use crate::response::{CacheStatus, ResponseEnvelope};
use crate::retry::RetryPolicy;
use crate::transport::{ReqwestTransport, Transport};
use crate::{Error, Response, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

/// An HTTP client with retries, response caching and ordered middleware.
///
/// The client is designed to be reused across multiple requests. Clones share the
/// transport, the cache store and the middleware registry.
///
/// # Examples
///
/// ```no_run
/// use waypost::{Client, Response, RetryPolicy};
/// use waypost::cache::{CacheSettings, CacheStrategy, RouteRule};
/// use std::time::Duration;
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
///     .timeout(Duration::from_secs(5))
///     .retry_policy(RetryPolicy::default().max_attempts(3))
///     .cache(
///         CacheSettings::default()
///             .ttl(Duration::from_secs(60))
///             .route(
///                 RouteRule::new("/pokemon/.*")?
///                     .strategy(CacheStrategy::SideCache)
///                     .ttl(Duration::from_secs(3600)),
///             ),
///     )
///     .build()?;
///
/// let pikachu: Response<Pokemon> = client.get("/pokemon/25").await?;
/// println!("{} ({:?})", pikachu.data.name, pikachu.cache_status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CacheStore>,
    base_url: Option<Url>,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    cache: CacheSettings,
    middleware: MiddlewareChain,
    next_request_id: AtomicU64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_ref().map(Url::as_str))
            .field("timeout", &self.inner.timeout)
            .field("retry_policy", &self.inner.retry_policy)
            .field("cache", &self.inner.cache)
            .field("middleware", &self.inner.middleware)
            .finish()
    }
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Runs `request` through the pipeline and returns the final envelope.
    ///
    /// A non-2xx status is an error unless an error middleware resolves it. The
    /// request is cancelled as soon as the token in its
    /// [`CallOptions`](crate::config::CallOptions) fires.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use waypost::{Client, RequestDescriptor};
    /// use waypost::config::CacheOverrides;
    /// use waypost::cache::CacheStrategy;
    /// use http::Method;
    ///
    /// # async fn example() -> Result<(), waypost::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://pokeapi.co/api/v2")?
    ///     .build()?;
    ///
    /// let request = RequestDescriptor::new(Method::GET, "/pokemon")
    ///     .with_query_param("limit", "20")
    ///     .with_cache(CacheOverrides::default().strategy(CacheStrategy::NoCache));
    ///
    /// let envelope = client.execute(request).await?;
    /// println!("{} after {} attempt(s)", envelope.status, envelope.attempts);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, request: RequestDescriptor) -> Result<ResponseEnvelope> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "request",
            request_id,
            method = %request.method,
            url = %request.url,
            cache_key = tracing::field::Empty,
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: RequestDescriptor) -> Result<ResponseEnvelope> {
        let started = Instant::now();
        let request = self.with_default_headers(request);

        if is_cancelled(&request) {
            return Err(Error::Cancelled);
        }

        let request = match self.inner.middleware.run_request(request.clone()).await {
            Ok(request) => Arc::new(request),
            Err(error) => return self.fail(error, Arc::new(request), 0, started).await,
        };
        trace_stage(Stage::Request, started);

        let resolution = match self.resolve(&request) {
            Ok(resolution) => resolution,
            Err(error) => return self.fail(error, request, 0, started).await,
        };
        tracing::Span::current().record("cache_key", resolution.key.as_str());

        let cached = if resolution.strategy.reads() {
            self.lookup(&resolution.key, &request).await
        } else {
            None
        };
        trace_stage("cache", started);

        match (resolution.strategy, &cached) {
            (CacheStrategy::CacheFirst | CacheStrategy::OnlyCache, Some(hit)) => {
                tracing::debug!(strategy = %resolution.strategy, "Cache hit");
                return self.respond(hit.clone(), started).await;
            }
            (CacheStrategy::OnlyCache, None) => {
                let error = Error::CacheMiss {
                    key: resolution.key.clone(),
                };
                return self.fail(error, request, 0, started).await;
            }
            _ => {}
        }

        let url = match request.resolve_url(self.inner.base_url.as_ref()) {
            Ok(url) => url,
            Err(error) => return self.fail(error, request, 0, started).await,
        };
        let policy = self.inner.retry_policy.with_overrides(&request.options.retry);
        let (result, attempts) = self.dispatch(&request, &url, &policy).await;
        trace_stage("dispatch", started);

        match result {
            Ok(mut envelope) => {
                if resolution.strategy.writes() && self.inner.cache.is_storable(&envelope) {
                    self.store(&resolution, &envelope).await;
                }
                envelope.cache_status = if resolution.strategy.reads() {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Bypass
                };

                // side-cache answers with what was stored before this fetch
                if let (CacheStrategy::SideCache, Some(previous)) = (resolution.strategy, &cached) {
                    tracing::debug!("Serving previously cached response");
                    envelope = previous.clone();
                }
                envelope.attempts = attempts;
                self.respond(envelope, started).await
            }
            Err(error) => match (resolution.strategy, &cached) {
                (CacheStrategy::SideCache, Some(previous)) if !matches!(error, Error::Cancelled) => {
                    tracing::warn!(error = %error, "Live request failed, serving cached response");
                    let mut envelope = previous.clone();
                    envelope.attempts = attempts;
                    self.respond(envelope, started).await
                }
                _ => self.fail(error, request, attempts, started).await,
            },
        }
    }

    /// Sends the request until it succeeds, the retry policy gives up, or the call
    /// is cancelled. Returns the outcome with the number of attempts made.
    async fn dispatch(
        &self,
        request: &Arc<RequestDescriptor>,
        url: &Url,
        policy: &RetryPolicy,
    ) -> (Result<ResponseEnvelope>, u32) {
        let timeout = request.options.timeout.or(self.inner.timeout);
        let token = request.options.cancellation.as_ref();
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!(url = %url, attempt, "Executing HTTP request");

            let error = match cancellable(token, self.attempt(request, url, timeout)).await {
                Ok(envelope) => return (Ok(envelope), attempt),
                Err(Error::Cancelled) => {
                    tracing::info!(attempt, "Request cancelled");
                    return (Err(Error::Cancelled), attempt);
                }
                Err(error) => error,
            };

            tracing::warn!(error = %error, attempt, "Request failed");
            if !policy.should_retry(&error, &request.method, attempt) {
                return (Err(error), attempt);
            }

            let delay = policy.delay_for(attempt, &error);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt,
                "Retrying request after delay"
            );
            let wait = async {
                tokio::time::sleep(delay).await;
                Ok::<(), Error>(())
            };
            if let Err(cancelled) = cancellable(token, wait).await {
                tracing::info!(attempt, "Request cancelled during backoff");
                return (Err(cancelled), attempt);
            }
        }
    }

    /// Executes a single transport attempt and classifies the outcome.
    async fn attempt(
        &self,
        request: &Arc<RequestDescriptor>,
        url: &Url,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let started = Instant::now();
        let send = self.inner.transport.send(url.clone(), request);
        let raw = match timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => send.await?,
        };

        let status = raw.status;
        tracing::info!(
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Received HTTP response"
        );

        if !status.is_success() {
            let response = String::from_utf8_lossy(&raw.body);
            if status.is_client_error() {
                tracing::error!(status = status.as_u16(), response = %response, "Client error (4xx)");
            } else if status.is_server_error() {
                tracing::warn!(status = status.as_u16(), response = %response, "Server error (5xx)");
            }
            return Err(Error::HttpStatus {
                status,
                headers: raw.headers,
                body: raw.body,
            });
        }

        Ok(ResponseEnvelope::new(
            status,
            raw.headers,
            raw.body,
            request.clone(),
        ))
    }

    /// Runs the response stage over a finished envelope.
    async fn respond(&self, mut envelope: ResponseEnvelope, started: Instant) -> Result<ResponseEnvelope> {
        envelope.latency = started.elapsed();
        let request = envelope.request.clone();
        let attempts = envelope.attempts;

        match self.inner.middleware.run_response(envelope).await {
            Ok(envelope) => {
                trace_stage(Stage::Response, started);
                Ok(envelope)
            }
            Err(error) => self.fail(error, request, attempts, started).await,
        }
    }

    /// Runs the error stage. Cancellation bypasses it.
    async fn fail(
        &self,
        error: Error,
        request: Arc<RequestDescriptor>,
        attempts: u32,
        started: Instant,
    ) -> Result<ResponseEnvelope> {
        if matches!(error, Error::Cancelled) {
            return Err(error);
        }

        let outcome = self
            .inner
            .middleware
            .run_error(ErrorContext::new(error, request, attempts))
            .await;
        trace_stage(Stage::Error, started);

        match outcome {
            Ok(mut envelope) => {
                tracing::info!(status = envelope.status.as_u16(), "Error resolved by middleware");
                envelope.attempts = attempts;
                envelope.latency = started.elapsed();
                Ok(envelope)
            }
            Err(error) => {
                tracing::warn!(error = %error, kind = ?error.kind(), attempts, "Request failed");
                Err(error)
            }
        }
    }

    /// Reads `key` from the store. A failing store or a corrupt entry counts as a miss.
    async fn lookup(
        &self,
        key: &str,
        request: &Arc<RequestDescriptor>,
    ) -> Option<ResponseEnvelope> {
        let entry = match self.inner.store.get(key).await {
            Ok(entry) => entry?,
            Err(error) => {
                tracing::warn!(error = %error, "Cache read failed, treating as miss");
                return None;
            }
        };
        let envelope = entry.value.to_envelope(request.clone());
        if envelope.is_none() {
            tracing::warn!(
                status = entry.value.status,
                "Cached entry has an invalid status, treating as miss"
            );
        }
        envelope
    }

    /// Writes `envelope` to the store. A failing store is logged and skipped.
    async fn store(&self, resolution: &Resolution, envelope: &ResponseEnvelope) {
        let snapshot = CachedResponse::from_envelope(envelope);
        if let Err(error) = self
            .inner
            .store
            .set(&resolution.key, snapshot, resolution.ttl)
            .await
        {
            tracing::warn!(error = %error, "Cache write failed, skipping");
        }
    }

    fn with_default_headers(&self, mut request: RequestDescriptor) -> RequestDescriptor {
        if self.inner.default_headers.is_empty() {
            return request;
        }
        // headers set on the request replace defaults of the same name
        let mut headers = self.inner.default_headers.clone();
        headers.extend(std::mem::take(&mut request.headers));
        request.headers = headers;
        request
    }

    /// Resolves the cache key, strategy and TTL that `request` would use.
    ///
    /// # Errors
    ///
    /// Returns an error if the request URL cannot be made absolute.
    pub fn resolve(&self, request: &RequestDescriptor) -> Result<Resolution> {
        let target = request.target_url(self.inner.base_url.as_ref())?;
        Ok(self.inner.cache.resolve(request, target.as_str()))
    }

    /// Removes the entry stored under `key`. Returns `true` if one was present.
    ///
    /// Store failures are logged and reported as `false`.
    pub async fn invalidate(&self, key: &str) -> bool {
        match self.inner.store.remove(key).await {
            Ok(removed) => removed,
            Err(error) => {
                tracing::warn!(cache_key = key, error = %error, "Cache invalidation failed");
                false
            }
        }
    }

    /// Registers a request middleware. It applies to requests started afterwards.
    pub fn register_request_middleware(
        &self,
        priority: i32,
        middleware: impl RequestMiddleware + 'static,
    ) {
        self.inner.middleware.register_request(priority, middleware);
    }

    /// Registers a response middleware. It applies to requests started afterwards.
    pub fn register_response_middleware(
        &self,
        priority: i32,
        middleware: impl ResponseMiddleware + 'static,
    ) {
        self.inner.middleware.register_response(priority, middleware);
    }

    /// Registers an error middleware. It applies to requests started afterwards.
    pub fn register_error_middleware(&self, priority: i32, middleware: impl ErrorMiddleware + 'static) {
        self.inner.middleware.register_error(priority, middleware);
    }

    /// Returns the middleware registry.
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.inner.middleware
    }

    /// Executes `request` and deserializes the JSON body into `Res`.
    ///
    /// # Errors
    ///
    /// Returns any pipeline error, or [`Error::DeserializationFailed`] if the body
    /// does not match `Res`.
    pub async fn call<Res>(&self, request: RequestDescriptor) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let envelope = self.execute(request).await?;
        Response::from_envelope(envelope)
    }

    /// Makes a GET request to the specified path.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use waypost::Client;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Pokemon { name: String }
    ///
    /// # async fn example() -> Result<(), waypost::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://pokeapi.co/api/v2")?
    ///     .build()?;
    ///
    /// let pokemon: waypost::Response<Pokemon> = client.get("/pokemon/25").await?;
    /// println!("Pokemon: {}", pokemon.data.name);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::GET, path)).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let request = RequestDescriptor::new(Method::POST, path).with_json(body)?;
        self.call(request).await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let request = RequestDescriptor::new(Method::PUT, path).with_json(body)?;
        self.call(request).await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.call(RequestDescriptor::new(Method::DELETE, path)).await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let request = RequestDescriptor::new(Method::PATCH, path).with_json(body)?;
        self.call(request).await
    }
}

fn is_cancelled(request: &RequestDescriptor) -> bool {
    request
        .options
        .cancellation
        .as_ref()
        .is_some_and(CancellationToken::is_cancelled)
}

/// Races `fut` against the cancellation token, if there is one.
async fn cancellable<T, F>(token: Option<&CancellationToken>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}

fn trace_stage(stage: impl fmt::Display, started: Instant) {
    tracing::debug!(
        stage = %stage,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Stage complete"
    );
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use waypost::{ClientBuilder, RetryPolicy};
/// use waypost::cache::{CacheSettings, RemoteStoreConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), waypost::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_policy(RetryPolicy::default().max_attempts(5))
///     .cache(CacheSettings::default().ttl(Duration::from_secs(300)))
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    cache: CacheSettings,
    store: Option<Arc<dyn CacheStore>>,
    transport: Option<Arc<dyn Transport>>,
    middleware: MiddlewareChain,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            timeout: None,
            retry_policy: RetryPolicy::default(),
            cache: CacheSettings::default(),
            store: None,
            transport: None,
            middleware: MiddlewareChain::default(),
        }
    }

    /// Sets the base URL that relative request URLs are joined to.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the timeout of each transport attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the global retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the global cache configuration.
    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Uses `store` instead of the store derived from the cache configuration.
    pub fn store(mut self, store: impl CacheStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Uses `transport` instead of the default `reqwest` transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Registers a request middleware.
    pub fn request_middleware(self, priority: i32, middleware: impl RequestMiddleware + 'static) -> Self {
        self.middleware.register_request(priority, middleware);
        self
    }

    /// Registers a response middleware.
    pub fn response_middleware(
        self,
        priority: i32,
        middleware: impl ResponseMiddleware + 'static,
    ) -> Self {
        self.middleware.register_response(priority, middleware);
        self
    }

    /// Registers an error middleware.
    pub fn error_middleware(self, priority: i32, middleware: impl ErrorMiddleware + 'static) -> Self {
        self.middleware.register_error(priority, middleware);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created, or if a remote store
    /// is configured but cannot be set up.
    pub fn build(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let store = match self.store {
            Some(store) => store,
            None => default_store(&self.cache)?,
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                store,
                base_url: self.base_url,
                default_headers: self.default_headers,
                timeout: self.timeout,
                retry_policy: self.retry_policy,
                cache: self.cache,
                middleware: self.middleware,
                next_request_id: AtomicU64::new(1),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_store(cache: &CacheSettings) -> Result<Arc<dyn CacheStore>> {
    match cache.remote_config() {
        #[cfg(feature = "redis")]
        Some(remote) => {
            let store = crate::cache::RedisStore::new(remote).map_err(|e| {
                Error::ConfigurationError(format!("Failed to create cache store: {}", e))
            })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(remote) => Err(Error::ConfigurationError(format!(
            "Remote cache store {} requires the `redis` feature",
            remote.url
        ))),
        None => Ok(Arc::new(MemoryStore::new(cache.capacity()))),
    }
}
