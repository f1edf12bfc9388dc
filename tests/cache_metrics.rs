use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    extract::Path,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use playcache::cache::{
    CacheConfig, CacheContext, EntryOptions, FetchError, FetchStrategy, InvalidationQueue,
    InvalidationStrategy, RoutePolicy, metric_names, response_cache_layer,
};
use serde_json::json;
use time::OffsetDateTime;
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Object layer: miss, fetch, hit, fetch error, capacity eviction.
    let cache = CacheContext::new(CacheConfig {
        max_entries: 1,
        routes: vec![RoutePolicy {
            prefix: "/tags/".to_string(),
            ttl_seconds: 60,
            stale_while_revalidate_seconds: None,
            tags: Vec::new(),
            vary: Vec::new(),
            private: false,
        }],
        ..CacheConfig::default()
    });
    let objects = cache.objects();
    let options = EntryOptions::new(std::time::Duration::from_secs(60));

    for _ in 0..2 {
        objects
            .resolve(
                "game:1",
                || async { Ok(json!({"id": 1})) },
                FetchStrategy::CacheFirst,
                &options,
            )
            .await
            .expect("resolve");
    }
    let _ = objects
        .resolve(
            "game:2",
            || async { Err(FetchError::transport("connection refused")) },
            FetchStrategy::NetworkOnly,
            &options,
        )
        .await;
    objects
        .store()
        .set("game:3", json!({"id": 3}), &options)
        .expect("set evicts game:1");

    // Invalidation queue length, drops and consumption latency.
    let queue = InvalidationQueue::new(1);
    let now = OffsetDateTime::now_utc();
    queue.publish("a", InvalidationStrategy::Lazy, now);
    queue.publish("b", InvalidationStrategy::Lazy, now);
    objects.invalidate("game:3", InvalidationStrategy::Lazy);
    objects.consume_lazy();

    // Response layer through the middleware.
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/tags/{slug}",
            get(move |Path(_slug): Path<String>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            cache.responses().clone(),
            response_cache_layer,
        ));

    for uri in ["/tags/one", "/tags/one", "/tags/two"] {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        metric_names::METRIC_HIT_TOTAL,
        metric_names::METRIC_MISS_TOTAL,
        metric_names::METRIC_EVICT_TOTAL,
        metric_names::METRIC_SIZE,
        metric_names::METRIC_LOOKUP_MS,
        metric_names::METRIC_FETCH_MS,
        metric_names::METRIC_FETCH_ERROR_TOTAL,
        metric_names::METRIC_QUEUE_LEN,
        metric_names::METRIC_QUEUE_DROPPED_TOTAL,
        metric_names::METRIC_CONSUME_MS,
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let layers: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == metric_names::METRIC_HIT_TOTAL)
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "layer")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(layers.contains("object"));
    assert!(layers.contains("response"));
}
