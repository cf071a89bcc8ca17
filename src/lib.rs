//! # Waypost - An HTTP request pipeline
//!
//! Waypost runs every request through the same pipeline: ordered request
//! middleware, a response cache with per-route strategies, automatic retries with
//! backoff, and ordered response and error middleware. The network call itself is
//! made by a pluggable [`Transport`], `reqwest` by default.
//!
//! ## Quick Start
//!
//! ```no_run
//! use waypost::{Client, RetryPolicy};
//! use waypost::cache::{CacheSettings, CacheStrategy, RouteRule};
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Pokemon {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), waypost::Error> {
//!     let client = Client::builder()
//!         .base_url("https://pokeapi.co/api/v2")?
//!         .timeout(Duration::from_secs(5))
//!         .retry_policy(RetryPolicy::default().max_attempts(3))
//!         .cache(
//!             CacheSettings::default()
//!                 .ttl(Duration::from_secs(60))
//!                 .route(
//!                     RouteRule::new("/pokemon/.*")?
//!                         .strategy(CacheStrategy::SideCache)
//!                         .ttl(Duration::from_secs(3600)),
//!                 ),
//!         )
//!         .build()?;
//!
//!     let pokemon = client.get::<Pokemon>("/pokemon/25").await?;
//!     println!("Pokemon: {}", pokemon.data.name);
//!     println!("Request took {:?}, cache: {:?}", pokemon.latency, pokemon.cache_status);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Cache strategies** - `cache-first`, `side-cache`, `only-cache` and `no-cache`, chosen globally, per route pattern or per call
//! - **Deterministic cache keys** - Method, URL, params and body in canonical form
//! - **Pluggable stores** - In-memory `moka` store by default, Redis with the `redis` feature
//! - **Retry policy** - Exponential, fixed or custom backoff with jitter, `Retry-After` support and method gating
//! - **Ordered middleware** - Request, response and error stages with priorities
//! - **Cancellation** - Per-call `CancellationToken` that aborts in-flight attempts and backoff sleeps
//! - **Automatic logging** - Structured logging with `tracing` for every stage
//!
//! ## Error Handling
//!
//! Every failure is one [`Error`] variant with a stable [`ErrorKind`]:
//!
//! ```no_run
//! use waypost::{Client, Error, ErrorKind};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/endpoint").await {
//!     Ok(response) => {
//!         println!("Success: {:?}", response.data);
//!     }
//!     Err(Error::DeserializationFailed { raw_response, serde_error, status }) => {
//!         eprintln!("Failed to deserialize (status {}):", status);
//!         eprintln!("  Raw response: {}", raw_response);
//!         eprintln!("  Error: {}", serde_error);
//!     }
//!     Err(e) if e.kind() == ErrorKind::HttpStatus => {
//!         eprintln!("HTTP error {:?}: {:?}", e.status(), e.raw_response());
//!     }
//!     Err(e) => {
//!         eprintln!("Other error: {}", e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Middleware
//!
//! Error middleware can turn a failure into a response:
//!
//! ```no_run
//! use waypost::{Client, ErrorContext, ResponseEnvelope};
//! use waypost::error::BoxError;
//! use waypost::middleware::ErrorOutcome;
//! use http::StatusCode;
//!
//! # async fn example() -> Result<(), waypost::Error> {
//! let client = Client::builder()
//!     .base_url("https://pokeapi.co/api/v2")?
//!     .error_middleware(5, |ctx: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
//!         if ctx.status() == Some(StatusCode::NOT_FOUND) {
//!             let body = serde_json::json!({ "found": false });
//!             return Ok(ErrorOutcome::Resolve(ResponseEnvelope::json(
//!                 StatusCode::OK,
//!                 body,
//!                 ctx.request.clone(),
//!             )));
//!         }
//!         Ok(ErrorOutcome::Continue)
//!     })
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod client;
pub mod config;
pub mod error;
pub mod middleware;
mod request;
mod response;
pub mod retry;
pub mod transport;

pub use cache::{CacheSettings, CacheStrategy, RouteRule};
pub use client::{Client, ClientBuilder};
pub use config::{CacheOverrides, CallOptions, RetryOverrides};
pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use request::{Body, QueryValue, RequestDescriptor};
pub use response::{CacheStatus, Response, ResponseEnvelope};
pub use retry::{Backoff, RetryPolicy, RetryPredicate};
pub use transport::{RawResponse, ReqwestTransport, Transport, TransportError};
