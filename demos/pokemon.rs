//! Fetching from the PokéAPI with route-level caching and a not-found fallback.
//!
//! This example shows how to:
//! - Cache `/pokemon/*` with the side-cache strategy for an hour
//! - Keep every other GET on cache-first for a minute
//! - Turn a 404 into a `{ "found": false }` response with error middleware
//! - Cancel a slow request
//!
//! Run with: `cargo run --example pokemon`

use http::{Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use waypost::cache::{CacheSettings, CacheStrategy, RouteRule};
use waypost::error::BoxError;
use waypost::middleware::ErrorOutcome;
use waypost::{Client, Error, ErrorContext, RequestDescriptor, ResponseEnvelope, RetryPolicy};

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Pokemon {
    id: u32,
    name: String,
    height: u32,
    weight: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("waypost=debug,pokemon=info")
        .init();

    let client = Client::builder()
        .base_url("https://pokeapi.co/api/v2")?
        .timeout(Duration::from_secs(5))
        .retry_policy(RetryPolicy::default().max_attempts(3))
        .cache(
            CacheSettings::default()
                .ttl(Duration::from_secs(60))
                .strategy(CacheStrategy::CacheFirst)
                .methods([Method::GET])
                .route(
                    RouteRule::new("/pokemon/.*")?
                        .strategy(CacheStrategy::SideCache)
                        .ttl(Duration::from_secs(3600)),
                ),
        )
        .error_middleware(5, |ctx: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
            if ctx.status() == Some(StatusCode::NOT_FOUND) {
                return Ok(ErrorOutcome::Resolve(ResponseEnvelope::json(
                    StatusCode::OK,
                    serde_json::json!({ "found": false }),
                    ctx.request.clone(),
                )));
            }
            Ok(ErrorOutcome::Continue)
        })
        .build()?;

    println!("=== Side-cache route ===");
    for _ in 0..2 {
        let response = client.get::<Pokemon>("/pokemon/25").await?;
        println!(
            "{} (#{}) cache: {:?}, latency: {:?}",
            response.data.name, response.data.id, response.cache_status, response.latency
        );
    }
    println!();

    println!("=== Not-found fallback ===");
    let missing = client.get::<serde_json::Value>("/pokemon/0").await?;
    println!("Response: {}", missing.data);
    println!();

    println!("=== Cancellation ===");
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    let request = RequestDescriptor::new(Method::GET, "/pokemon")
        .with_query_param("limit", "1000")
        .with_cancellation(token);
    match client.execute(request).await {
        Err(Error::Cancelled) => println!("Request was cancelled"),
        Ok(response) => println!("Finished before cancellation: {}", response.status),
        Err(e) => return Err(e),
    }

    Ok(())
}
