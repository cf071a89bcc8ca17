//! Ordered request, response and error middleware.
//!
//! Each [`Stage`] has its own list. Entries run in ascending priority; entries with
//! equal priority run in registration order. The list is sorted on every run, so
//! an entry registered between two requests applies from the next one on.
//!
//! Plain closures implement the middleware traits:
//!
//! ```
//! use waypost::middleware::{ErrorOutcome, MiddlewareChain};
//! use waypost::{ErrorContext, RequestDescriptor, ResponseEnvelope};
//! use waypost::error::BoxError;
//! use http::StatusCode;
//!
//! let chain = MiddlewareChain::default();
//! chain.register_request(10, |request: RequestDescriptor| -> Result<RequestDescriptor, BoxError> {
//!     Ok(request.with_header("x-client", "waypost")?)
//! });
//! chain.register_error(5, |ctx: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
//!     if ctx.status() == Some(StatusCode::NOT_FOUND) {
//!         let fallback = serde_json::json!({ "found": false });
//!         return Ok(ErrorOutcome::Resolve(ResponseEnvelope::json(
//!             StatusCode::OK,
//!             fallback,
//!             ctx.request.clone(),
//!         )));
//!     }
//!     Ok(ErrorOutcome::Continue)
//! });
//! ```

use crate::error::{BoxError, ErrorContext};
use crate::request::RequestDescriptor;
use crate::response::ResponseEnvelope;
use crate::Error;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A point in the request lifecycle where middleware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before the cache lookup and the transport call.
    Request,
    /// After a response was obtained.
    Response,
    /// After the request failed.
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Request => "request",
            Stage::Response => "response",
            Stage::Error => "error",
        })
    }
}

/// Transforms a request before it is resolved against the cache and sent.
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    /// Returns the request to continue with. An `Err` aborts the request.
    async fn on_request(&self, request: RequestDescriptor) -> Result<RequestDescriptor, BoxError>;
}

#[async_trait]
impl<F> RequestMiddleware for F
where
    F: Fn(RequestDescriptor) -> Result<RequestDescriptor, BoxError> + Send + Sync,
{
    async fn on_request(&self, request: RequestDescriptor) -> Result<RequestDescriptor, BoxError> {
        self(request)
    }
}

/// Transforms a response before it is returned to the caller.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    /// Returns the response to continue with. An `Err` fails the request.
    async fn on_response(&self, response: ResponseEnvelope) -> Result<ResponseEnvelope, BoxError>;
}

#[async_trait]
impl<F> ResponseMiddleware for F
where
    F: Fn(ResponseEnvelope) -> Result<ResponseEnvelope, BoxError> + Send + Sync,
{
    async fn on_response(&self, response: ResponseEnvelope) -> Result<ResponseEnvelope, BoxError> {
        self(response)
    }
}

/// What an error middleware decided.
#[derive(Debug)]
pub enum ErrorOutcome {
    /// Leave the error as it is and run the next entry.
    Continue,
    /// Reclassify: replace the error and run the next entry.
    Replace(Error),
    /// Recover: stop the chain and answer with this response.
    Resolve(ResponseEnvelope),
}

/// Inspects a failed request, and may recover it or reclassify the error.
#[async_trait]
pub trait ErrorMiddleware: Send + Sync {
    /// Decides what happens to `error`. An `Err` aborts the chain.
    async fn on_error(&self, error: &ErrorContext) -> Result<ErrorOutcome, BoxError>;
}

#[async_trait]
impl<F> ErrorMiddleware for F
where
    F: Fn(&ErrorContext) -> Result<ErrorOutcome, BoxError> + Send + Sync,
{
    async fn on_error(&self, error: &ErrorContext) -> Result<ErrorOutcome, BoxError> {
        self(error)
    }
}

struct Entry<M: ?Sized> {
    priority: i32,
    seq: u64,
    middleware: Arc<M>,
}

impl<M: ?Sized> Clone for Entry<M> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            seq: self.seq,
            middleware: Arc::clone(&self.middleware),
        }
    }
}

/// The three middleware lists of one client.
///
/// Registration takes `&self` and may happen while requests are in flight; a
/// running request keeps the snapshot it started its stage with.
#[derive(Default)]
pub struct MiddlewareChain {
    request: RwLock<Vec<Entry<dyn RequestMiddleware>>>,
    response: RwLock<Vec<Entry<dyn ResponseMiddleware>>>,
    error: RwLock<Vec<Entry<dyn ErrorMiddleware>>>,
    seq: AtomicU64,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("request", &self.request.read().len())
            .field("response", &self.response.read().len())
            .field("error", &self.error.read().len())
            .finish()
    }
}

impl MiddlewareChain {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a request-stage middleware.
    pub fn register_request(&self, priority: i32, middleware: impl RequestMiddleware + 'static) {
        let entry = Entry {
            priority,
            seq: self.next_seq(),
            middleware: Arc::new(middleware) as Arc<dyn RequestMiddleware>,
        };
        self.request.write().push(entry);
    }

    /// Registers a response-stage middleware.
    pub fn register_response(&self, priority: i32, middleware: impl ResponseMiddleware + 'static) {
        let entry = Entry {
            priority,
            seq: self.next_seq(),
            middleware: Arc::new(middleware) as Arc<dyn ResponseMiddleware>,
        };
        self.response.write().push(entry);
    }

    /// Registers an error-stage middleware.
    pub fn register_error(&self, priority: i32, middleware: impl ErrorMiddleware + 'static) {
        let entry = Entry {
            priority,
            seq: self.next_seq(),
            middleware: Arc::new(middleware) as Arc<dyn ErrorMiddleware>,
        };
        self.error.write().push(entry);
    }

    /// Returns the number of entries registered for `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        match stage {
            Stage::Request => self.request.read().len(),
            Stage::Response => self.response.read().len(),
            Stage::Error => self.error.read().len(),
        }
    }

    /// Returns `true` if no stage has any entry.
    pub fn is_empty(&self) -> bool {
        [Stage::Request, Stage::Response, Stage::Error]
            .iter()
            .all(|stage| self.len(*stage) == 0)
    }

    /// Feeds `request` through the request stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Middleware`] from the first entry that fails; later entries
    /// do not run.
    pub async fn run_request(&self, mut request: RequestDescriptor) -> Result<RequestDescriptor, Error> {
        for middleware in sorted(&self.request) {
            request = middleware
                .on_request(request)
                .await
                .map_err(|source| stage_failure(Stage::Request, source, None))?;
        }
        Ok(request)
    }

    /// Feeds `response` through the response stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Middleware`] from the first entry that fails.
    pub async fn run_response(&self, mut response: ResponseEnvelope) -> Result<ResponseEnvelope, Error> {
        for middleware in sorted(&self.response) {
            response = middleware
                .on_response(response)
                .await
                .map_err(|source| stage_failure(Stage::Response, source, None))?;
        }
        Ok(response)
    }

    /// Feeds a failure through the error stage.
    ///
    /// Stops at the first entry that resolves the error and returns its response.
    /// If no entry does, returns the (possibly replaced) error.
    ///
    /// # Errors
    ///
    /// Returns the unresolved error, or [`Error::Middleware`] carrying it as
    /// `cause` if an entry fails.
    pub async fn run_error(&self, mut context: ErrorContext) -> Result<ResponseEnvelope, Error> {
        for middleware in sorted(&self.error) {
            match middleware.on_error(&context).await {
                Ok(ErrorOutcome::Continue) => {}
                Ok(ErrorOutcome::Replace(error)) => context.error = error,
                Ok(ErrorOutcome::Resolve(response)) => return Ok(response),
                Err(source) => {
                    return Err(stage_failure(
                        Stage::Error,
                        source,
                        Some(Box::new(context.error)),
                    ))
                }
            }
        }
        Err(context.error)
    }
}

fn sorted<M: ?Sized>(list: &RwLock<Vec<Entry<M>>>) -> Vec<Arc<M>> {
    let mut entries = list.read().clone();
    entries.sort_by_key(|entry| (entry.priority, entry.seq));
    entries.into_iter().map(|entry| entry.middleware).collect()
}

fn stage_failure(stage: Stage, source: BoxError, cause: Option<Box<Error>>) -> Error {
    tracing::warn!(stage = %stage, error = %source, "Middleware failed");
    Error::Middleware {
        stage,
        source,
        cause,
    }
}
