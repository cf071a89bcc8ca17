//! Pipeline tests driven by a scripted in-process transport.

use async_trait::async_trait;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use waypost::cache::{
    CacheEntry, CacheSettings, CacheStore, CacheStrategy, CachedResponse, MemoryStore, RouteRule,
    StoreError,
};
use waypost::error::BoxError;
use waypost::middleware::ErrorOutcome;
use waypost::{
    CacheOverrides, CacheStatus, Client, Error, ErrorContext, ErrorKind, RawResponse,
    RequestDescriptor, ResponseEnvelope, RetryOverrides, Transport, TransportError,
};

#[derive(Clone, Copy)]
enum Step {
    Status(u16, &'static str),
    Refused,
    Hang(Duration),
}

/// Answers the n-th call with `script(n)` and counts calls.
#[derive(Clone)]
struct ScriptedTransport {
    calls: Arc<AtomicUsize>,
    script: Arc<dyn Fn(usize) -> Step + Send + Sync>,
}

impl ScriptedTransport {
    fn new(script: impl Fn(usize) -> Step + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(script),
        }
    }

    fn always(step: Step) -> Self {
        Self::new(move |_| step)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _url: Url,
        _request: &RequestDescriptor,
    ) -> Result<RawResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(n) {
            Step::Status(code, body) => Ok(RawResponse::new(
                StatusCode::from_u16(code).unwrap(),
                body,
            )),
            Step::Refused => Err(TransportError::Connect("connection refused".into())),
            Step::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(RawResponse::new(StatusCode::OK, "late"))
            }
        }
    }
}

/// A store whose backend is always down.
struct UnavailableStore;

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Err(StoreError::Unavailable("backend down".into()))
    }

    async fn set(&self, _key: &str, _value: CachedResponse, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("backend down".into()))
    }

    async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("backend down".into()))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_with(transport: &ScriptedTransport, cache: CacheSettings) -> Client {
    init_tracing();
    Client::builder()
        .base_url("https://pokeapi.co/api/v2")
        .unwrap()
        .transport(transport.clone())
        .cache(cache)
        .build()
        .unwrap()
}

fn get(path: &str) -> RequestDescriptor {
    RequestDescriptor::new(Method::GET, path)
}

#[tokio::test]
async fn test_cache_first_second_call_skips_transport() {
    let transport = ScriptedTransport::always(Step::Status(200, r#"{"id":25}"#));
    let client = client_with(&transport, CacheSettings::default());

    let first = client.execute(get("/pokemon/25")).await.unwrap();
    let second = client.execute(get("/pokemon/25")).await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(first.body, second.body);
    assert_eq!(first.cache_status, CacheStatus::Miss);
    assert_eq!(second.cache_status, CacheStatus::Hit);
    assert!(second.is_cached());
}

#[tokio::test]
async fn test_distinct_params_are_distinct_entries() {
    let transport = ScriptedTransport::always(Step::Status(200, "[]"));
    let client = client_with(&transport, CacheSettings::default());

    client
        .execute(get("/pokemon").with_query_param("offset", "0"))
        .await
        .unwrap();
    client
        .execute(get("/pokemon").with_query_param("offset", "20"))
        .await
        .unwrap();
    client
        .execute(get("/pokemon").with_query_param("offset", "0"))
        .await
        .unwrap();

    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_surfaces_last_error() {
    let transport = ScriptedTransport::always(Step::Status(503, "down"));
    let client = client_with(&transport, CacheSettings::disabled());

    let err = client.execute(get("/pokemon/25")).await.unwrap_err();

    assert_eq!(transport.calls(), 3);
    match err {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body.as_ref(), b"down");
        }
        other => panic!("Expected HttpStatus, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_errors_retried_for_any_method() {
    let transport = ScriptedTransport::new(|n| {
        if n < 2 {
            Step::Refused
        } else {
            Step::Status(201, r#"{"ok":true}"#)
        }
    });
    let client = client_with(&transport, CacheSettings::default());

    let request = RequestDescriptor::new(Method::POST, "/pokemon")
        .with_json(&serde_json::json!({ "name": "mew" }))
        .unwrap();
    let response = client.execute(request).await.unwrap();

    assert_eq!(transport.calls(), 3);
    assert_eq!(response.attempts, 3);
    assert_eq!(response.status, StatusCode::CREATED);
}

#[tokio::test(start_paused = true)]
async fn test_post_never_cached_and_not_retried_on_status() {
    let transport = ScriptedTransport::new(|n| {
        if n < 2 {
            Step::Status(200, "{}")
        } else {
            Step::Status(503, "down")
        }
    });
    let client = client_with(&transport, CacheSettings::default());

    for _ in 0..2 {
        let response = client
            .execute(RequestDescriptor::new(Method::POST, "/pokemon"))
            .await
            .unwrap();
        assert_eq!(response.cache_status, CacheStatus::Bypass);
    }
    assert_eq!(transport.calls(), 2);

    let err = client
        .execute(RequestDescriptor::new(Method::POST, "/pokemon"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_side_cache_answers_previous_value_and_refreshes_store() {
    let transport = ScriptedTransport::new(|n| match n {
        0 => Step::Status(200, "v1"),
        1 => Step::Status(200, "v2"),
        _ => Step::Status(500, "down"),
    });
    let store = MemoryStore::new(100);
    let client = Client::builder()
        .base_url("https://pokeapi.co/api/v2")
        .unwrap()
        .transport(transport.clone())
        .store(store.clone())
        .cache(CacheSettings::default().strategy(CacheStrategy::SideCache))
        .build()
        .unwrap();
    let key = client.resolve(&get("/pokemon/25")).unwrap().key;

    let first = client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(first.text(), "v1");
    assert_eq!(first.cache_status, CacheStatus::Miss);

    let second = client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(second.text(), "v1");
    assert_eq!(second.cache_status, CacheStatus::Hit);
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.value.body.as_ref(), b"v2");

    // live call fails; the stored value still answers
    let third = client
        .execute(get("/pokemon/25").with_retry(RetryOverrides::disabled()))
        .await
        .unwrap();
    assert_eq!(third.text(), "v2");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_pokemon_route_rule() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(
        &transport,
        CacheSettings::default()
            .ttl(Duration::from_millis(60_000))
            .strategy(CacheStrategy::CacheFirst)
            .methods([Method::GET])
            .route(
                RouteRule::new("/pokemon/.*")
                    .unwrap()
                    .strategy(CacheStrategy::SideCache)
                    .ttl(Duration::from_millis(3_600_000)),
            ),
    );

    let pokemon = client.resolve(&get("/pokemon/25")).unwrap();
    assert_eq!(pokemon.strategy, CacheStrategy::SideCache);
    assert_eq!(pokemon.ttl, Duration::from_millis(3_600_000));

    let berry = client.resolve(&get("/berry/1")).unwrap();
    assert_eq!(berry.strategy, CacheStrategy::CacheFirst);
    assert_eq!(berry.ttl, Duration::from_millis(60_000));

    client.execute(get("/pokemon/25")).await.unwrap();
    client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(transport.calls(), 2);

    client.execute(get("/berry/1")).await.unwrap();
    client.execute(get("/berry/1")).await.unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_only_cache_hit_and_miss() {
    let transport = ScriptedTransport::always(Step::Status(200, "cached"));
    let client = client_with(&transport, CacheSettings::default());

    let only_cache = || {
        get("/pokemon/25").with_cache(CacheOverrides::default().strategy(CacheStrategy::OnlyCache))
    };

    let err = client.execute(only_cache()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CacheMiss);
    assert_eq!(transport.calls(), 0);

    client.execute(get("/pokemon/25")).await.unwrap();
    let hit = client.execute(only_cache()).await.unwrap();
    assert_eq!(hit.text(), "cached");
    assert_eq!(hit.attempts, 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_store_failures_are_absorbed() {
    let transport = ScriptedTransport::always(Step::Status(200, "fresh"));
    let client = Client::builder()
        .base_url("https://pokeapi.co/api/v2")
        .unwrap()
        .transport(transport.clone())
        .store(UnavailableStore)
        .build()
        .unwrap();

    for _ in 0..2 {
        let response = client.execute(get("/pokemon/25")).await.unwrap();
        assert_eq!(response.text(), "fresh");
    }
    assert_eq!(transport.calls(), 2);
    assert!(!client.invalidate("anything").await);
}

#[tokio::test]
async fn test_corrupt_cached_status_is_a_miss() {
    let transport = ScriptedTransport::always(Step::Status(200, "fresh"));
    let store = MemoryStore::new(100);
    let client = Client::builder()
        .base_url("https://pokeapi.co/api/v2")
        .unwrap()
        .transport(transport.clone())
        .store(store.clone())
        .build()
        .unwrap();
    let key = client.resolve(&get("/pokemon/25")).unwrap().key;

    let corrupt = CachedResponse {
        status: 7,
        headers: Vec::new(),
        body: "stale".into(),
        method: "GET".to_string(),
        url: "/pokemon/25".to_string(),
    };
    store.set(&key, corrupt, Duration::from_secs(60)).await.unwrap();

    let response = client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "fresh");
    assert_eq!(response.cache_status, CacheStatus::Miss);
    assert_eq!(transport.calls(), 1);

    // the live response replaced the corrupt entry
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.value.status, 200);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::default());
    let key = client.resolve(&get("/pokemon/25")).unwrap().key;

    client.execute(get("/pokemon/25")).await.unwrap();
    assert!(client.invalidate(&key).await);
    client.execute(get("/pokemon/25")).await.unwrap();

    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_error_middleware_resolves_not_found() {
    let transport = ScriptedTransport::always(Step::Status(404, "Not found"));
    let client = client_with(&transport, CacheSettings::default());
    client.register_error_middleware(5, |ctx: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
        if ctx.status() == Some(StatusCode::NOT_FOUND) {
            return Ok(ErrorOutcome::Resolve(ResponseEnvelope::json(
                StatusCode::OK,
                serde_json::json!({ "found": false }),
                ctx.request.clone(),
            )));
        }
        Ok(ErrorOutcome::Continue)
    });

    let response = client.call::<serde_json::Value>(get("/pokemon/0")).await.unwrap();
    assert_eq!(response.data, serde_json::json!({ "found": false }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_attempt() {
    let transport = ScriptedTransport::always(Step::Hang(Duration::from_millis(5000)));
    let client = client_with(&transport, CacheSettings::disabled());

    let error_calls = Arc::new(AtomicUsize::new(0));
    let counter = error_calls.clone();
    client.register_error_middleware(0, move |_: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(ErrorOutcome::Continue)
    });

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let request = get("/pokemon/25")
        .with_timeout(Duration::from_millis(5000))
        .with_cancellation(token);
    let err = client.execute(request).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(5000));
    assert_eq!(transport.calls(), 1);
    assert_eq!(error_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_sends_nothing() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::default());

    let token = CancellationToken::new();
    token.cancel();
    let err = client
        .execute(get("/pokemon/25").with_cancellation(token))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_per_attempt() {
    let transport = ScriptedTransport::always(Step::Hang(Duration::from_secs(10)));
    let client = client_with(&transport, CacheSettings::disabled());

    let request = get("/pokemon/25")
        .with_timeout(Duration::from_millis(100))
        .with_retry(RetryOverrides::default().max_attempts(2));
    let err = client.execute(request).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(limit) if limit == Duration::from_millis(100)));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_middleware_priority_and_ties() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    for (priority, tag) in [(10, "c"), (1, "a"), (5, "b1"), (5, "b2")] {
        let log = log.clone();
        client.register_request_middleware(
            priority,
            move |request: RequestDescriptor| -> Result<RequestDescriptor, BoxError> {
                log.lock().push(tag);
                Ok(request)
            },
        );
    }

    client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(*log.lock(), vec!["a", "b1", "b2", "c"]);
}

#[tokio::test]
async fn test_response_middleware_runs_on_cache_hits() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    client.register_response_middleware(
        0,
        move |response: ResponseEnvelope| -> Result<ResponseEnvelope, BoxError> {
            log.lock().push(response.cache_status);
            Ok(response)
        },
    );

    client.execute(get("/pokemon/25")).await.unwrap();
    client.execute(get("/pokemon/25")).await.unwrap();

    assert_eq!(*seen.lock(), vec![CacheStatus::Miss, CacheStatus::Hit]);
}

#[tokio::test]
async fn test_request_middleware_failure_sends_nothing() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::default());
    client.register_request_middleware(0, |_: RequestDescriptor| -> Result<RequestDescriptor, BoxError> {
        Err("missing credentials".into())
    });

    let seen_kind = Arc::new(Mutex::new(None));
    let recorder = seen_kind.clone();
    client.register_error_middleware(0, move |ctx: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
        *recorder.lock() = Some(ctx.kind());
        Ok(ErrorOutcome::Continue)
    });

    let err = client.execute(get("/pokemon/25")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Middleware);
    assert_eq!(*seen_kind.lock(), Some(ErrorKind::Middleware));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_failing_error_middleware_keeps_original_error() {
    let transport = ScriptedTransport::always(Step::Status(400, "bad"));
    let client = client_with(&transport, CacheSettings::default());
    client.register_error_middleware(0, |_: &ErrorContext| -> Result<ErrorOutcome, BoxError> {
        Err("reporter crashed".into())
    });

    match client.execute(get("/pokemon/25")).await {
        Err(Error::Middleware {
            cause: Some(cause), ..
        }) => assert_eq!(cause.status(), Some(StatusCode::BAD_REQUEST)),
        other => panic!("Expected Middleware error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_client() {
    let transport = ScriptedTransport::always(Step::Status(200, "{}"));
    let client = client_with(&transport, CacheSettings::disabled());

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.execute(get(&format!("/pokemon/{}", i))).await })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(transport.calls(), 10);
}

#[tokio::test]
async fn test_should_cache_predicate_controls_writes() {
    let transport = ScriptedTransport::always(Step::Status(202, "{}"));
    let client = client_with(
        &transport,
        CacheSettings::default().should_cache(|response| response.status == StatusCode::OK),
    );

    client.execute(get("/pokemon/25")).await.unwrap();
    client.execute(get("/pokemon/25")).await.unwrap();
    assert_eq!(transport.calls(), 2);
}
