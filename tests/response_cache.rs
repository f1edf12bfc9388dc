use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{Method, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::BodyExt;
use playcache::cache::{
    CacheConfig, CacheContext, Clock, EventKind, ManualClock, RoutePolicy, X_CACHE,
    response_cache_layer,
};
use tower::ServiceExt;

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn game(State(counter): State<Counter>, Path(id): Path<u64>) -> Response {
    let call = counter.bump();
    format!("game {id} render {call}").into_response()
}

async fn session(State(counter): State<Counter>) -> Response {
    counter.bump();
    ([(header::SET_COOKIE, "session=abc")], "with cookie").into_response()
}

async fn broken(State(counter): State<Counter>) -> Response {
    counter.bump();
    (StatusCode::BAD_GATEWAY, "upstream down").into_response()
}

async fn create(State(counter): State<Counter>) -> Response {
    counter.bump();
    StatusCode::CREATED.into_response()
}

fn route(prefix: &str, private: bool) -> RoutePolicy {
    RoutePolicy {
        prefix: prefix.to_string(),
        ttl_seconds: 10,
        stale_while_revalidate_seconds: Some(60),
        tags: vec!["catalog".to_string(), "game:{last}".to_string()],
        vary: Vec::new(),
        private,
    }
}

struct Harness {
    router: Router,
    counter: Counter,
    cache: CacheContext,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = CacheContext::with_clock(
        CacheConfig {
            routes: vec![route("/api/games/", false), route("/api/me", true)],
            ..CacheConfig::default()
        },
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let counter = Counter::default();

    let router = Router::new()
        .route("/api/games/{id}", get(game).post(create))
        .route("/api/games/session", get(session))
        .route("/api/games/broken", get(broken))
        .route("/uncached", get(|| async { "plain" }))
        .with_state(counter.clone())
        .layer(middleware::from_fn_with_state(
            cache.responses().clone(),
            response_cache_layer,
        ));

    Harness {
        router,
        counter,
        cache,
        clock,
    }
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.expect("response")
}

fn x_cache(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let h = harness();

    let first = send(&h.router, get_request("/api/games/7")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(x_cache(&first), Some("MISS"));
    assert!(first.headers().contains_key(header::ETAG));
    assert!(first.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(
        first.headers().get(header::CACHE_CONTROL).expect("cache-control"),
        "public, max-age=10, stale-while-revalidate=60"
    );
    let first_body = body_text(first).await;

    let second = send(&h.router, get_request("/api/games/7")).await;
    assert_eq!(x_cache(&second), Some("HIT"));
    assert_eq!(body_text(second).await, first_body);
    assert_eq!(h.counter.get(), 1);

    let snapshot = h.cache.responses().cache().metrics();
    assert_eq!(snapshot.layer, "response");
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);
}

#[tokio::test]
async fn query_order_does_not_split_the_cache() {
    let h = harness();

    send(&h.router, get_request("/api/games/7?a=1&b=2")).await;
    let reordered = send(&h.router, get_request("/api/games/7?b=2&a=1")).await;

    assert_eq!(x_cache(&reordered), Some("HIT"));
    assert_eq!(h.counter.get(), 1);
}

#[tokio::test]
async fn matching_if_none_match_yields_not_modified() {
    let h = harness();

    let first = send(&h.router, get_request("/api/games/8")).await;
    let etag = first
        .headers()
        .get(header::ETAG)
        .expect("etag")
        .clone();

    let conditional = Request::builder()
        .uri("/api/games/8")
        .header(header::IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, conditional).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get(header::ETAG), Some(&etag));
    assert!(body_text(response).await.is_empty());

    let mismatched = Request::builder()
        .uri("/api/games/8")
        .header(header::IF_NONE_MATCH, "\"0000000000000000\"")
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, mismatched).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(x_cache(&response), Some("HIT"));
    assert_eq!(h.counter.get(), 1);
}

#[tokio::test]
async fn if_modified_since_is_honoured_without_etag() {
    let h = harness();

    let first = send(&h.router, get_request("/api/games/9")).await;
    let last_modified = first
        .headers()
        .get(header::LAST_MODIFIED)
        .expect("last-modified")
        .clone();

    let conditional = Request::builder()
        .uri("/api/games/9")
        .header(header::IF_MODIFIED_SINCE, last_modified)
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, conditional).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn stale_response_is_served_while_revalidating() {
    let h = harness();

    let first = send(&h.router, get_request("/api/games/10")).await;
    assert_eq!(body_text(first).await, "game 10 render 1");

    h.clock.advance(Duration::from_secs(30));

    let stale = send(&h.router, get_request("/api/games/10")).await;
    assert_eq!(x_cache(&stale), Some("STALE"));
    assert_eq!(body_text(stale).await, "game 10 render 1");

    for _ in 0..100 {
        if h.counter.get() == 2 && h.cache.responses().revalidating().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.counter.get(), 2);

    let refreshed = send(&h.router, get_request("/api/games/10")).await;
    assert_eq!(x_cache(&refreshed), Some("HIT"));
    assert_eq!(body_text(refreshed).await, "game 10 render 2");
}

#[tokio::test]
async fn stale_entry_still_answers_conditional_requests() {
    let h = harness();

    let first = send(&h.router, get_request("/api/games/12")).await;
    let etag = first
        .headers()
        .get(header::ETAG)
        .expect("etag")
        .clone();
    h.clock.advance(Duration::from_secs(30));

    let conditional = Request::builder()
        .uri("/api/games/12")
        .header(header::IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, conditional).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(x_cache(&response), Some("STALE"));
    assert_eq!(response.headers().get(header::ETAG), Some(&etag));
    assert!(body_text(response).await.is_empty());

    for _ in 0..100 {
        if h.counter.get() == 2 && h.cache.responses().revalidating().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.counter.get(), 2);
}

#[tokio::test]
async fn expired_response_is_refetched() {
    let h = harness();

    send(&h.router, get_request("/api/games/11")).await;
    h.clock.advance(Duration::from_secs(120));

    let response = send(&h.router, get_request("/api/games/11")).await;
    assert_eq!(x_cache(&response), Some("MISS"));
    assert_eq!(h.counter.get(), 2);
}

#[tokio::test]
async fn non_get_and_event_stream_requests_bypass_the_cache() {
    let h = harness();

    let post = Request::builder()
        .method(Method::POST)
        .uri("/api/games/12")
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, post).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(x_cache(&response).is_none());

    for _ in 0..2 {
        let stream = Request::builder()
            .uri("/api/games/12")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .expect("request");
        let response = send(&h.router, stream).await;
        assert!(x_cache(&response).is_none());
    }

    let uncached = send(&h.router, get_request("/uncached")).await;
    assert!(x_cache(&uncached).is_none());

    assert_eq!(h.counter.get(), 3);
    assert!(h.cache.responses().cache().store().is_empty());
}

#[tokio::test]
async fn cookies_and_errors_are_never_stored() {
    let h = harness();

    for _ in 0..2 {
        let response = send(&h.router, get_request("/api/games/session")).await;
        assert_eq!(x_cache(&response), Some("MISS"));
        assert!(response.headers().contains_key(header::SET_COOKIE));
    }
    for _ in 0..2 {
        let response = send(&h.router, get_request("/api/games/broken")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    assert_eq!(h.counter.get(), 4);
    assert!(h.cache.responses().cache().store().is_empty());
}

#[tokio::test]
async fn oversized_bodies_are_served_but_not_stored() {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = CacheContext::with_clock(
        CacheConfig {
            routes: vec![route("/big", false)],
            response_body_limit_bytes: 8,
            ..CacheConfig::default()
        },
        clock as Arc<dyn Clock>,
    );
    let router = Router::new()
        .route("/big", get(|| async { "a body longer than eight bytes" }))
        .layer(middleware::from_fn_with_state(
            cache.responses().clone(),
            response_cache_layer,
        ));

    let response = send(&router, get_request("/big")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "a body longer than eight bytes");
    assert!(cache.responses().cache().store().is_empty());
}

#[tokio::test]
async fn game_refresh_event_invalidates_tagged_responses() {
    let h = harness();

    send(&h.router, get_request("/api/games/13")).await;
    send(&h.router, get_request("/api/games/14")).await;

    let invalidated = h
        .cache
        .trigger()
        .trigger(&EventKind::GameMetadataRefreshed { game_id: 13 });
    assert_eq!(invalidated.responses, 1);

    let refetched = send(&h.router, get_request("/api/games/13")).await;
    assert_eq!(x_cache(&refetched), Some("MISS"));
    let untouched = send(&h.router, get_request("/api/games/14")).await;
    assert_eq!(x_cache(&untouched), Some("HIT"));
}

#[tokio::test]
async fn private_responses_are_scoped_per_viewer_and_dropped_on_sign_out() {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = CacheContext::with_clock(
        CacheConfig {
            routes: vec![route("/api/me", true)],
            ..CacheConfig::default()
        },
        clock as Arc<dyn Clock>,
    );
    let counter = Counter::default();
    let router = Router::new()
        .route(
            "/api/me",
            get(|State(counter): State<Counter>| async move {
                format!("me {}", counter.bump())
            }),
        )
        .with_state(counter.clone())
        .layer(middleware::from_fn_with_state(
            cache.responses().clone(),
            response_cache_layer,
        ));

    let as_viewer = |token: &str| {
        Request::builder()
            .uri("/api/me")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request")
    };

    let alice = send(&router, as_viewer("alice")).await;
    assert_eq!(
        alice.headers().get(header::CACHE_CONTROL).expect("cache-control"),
        "private, max-age=10, stale-while-revalidate=60"
    );
    send(&router, as_viewer("bob")).await;
    let alice_again = send(&router, as_viewer("alice")).await;
    assert_eq!(x_cache(&alice_again), Some("HIT"));
    assert_eq!(counter.get(), 2);

    let invalidated = cache.trigger().trigger(&EventKind::SignedOut {
        user_id: uuid::Uuid::new_v4(),
    });
    assert_eq!(invalidated.responses, 2);
    assert!(cache.responses().cache().store().is_empty());
}

#[tokio::test]
async fn game_refresh_event_invalidates_batches_containing_the_game() {
    let cache = CacheContext::with_clock(
        CacheConfig::default(),
        Arc::new(ManualClock::starting_now()) as Arc<dyn Clock>,
    );
    let counter = Counter::default();
    let router = Router::new()
        .route(
            "/api/games",
            get(|State(counter): State<Counter>| async move {
                format!("batch {}", counter.bump())
            }),
        )
        .with_state(counter.clone())
        .layer(middleware::from_fn_with_state(
            cache.responses().clone(),
            response_cache_layer,
        ));

    let first = send(&router, get_request("/api/games?ids=1,2")).await;
    assert_eq!(x_cache(&first), Some("MISS"));
    send(&router, get_request("/api/games?ids=3")).await;

    let invalidated = cache.trigger().game_metadata_refreshed(1);
    assert_eq!(invalidated.responses, 1);

    let refetched = send(&router, get_request("/api/games?ids=1,2")).await;
    assert_eq!(x_cache(&refetched), Some("MISS"));
    assert_eq!(body_text(refetched).await, "batch 3");
    let untouched = send(&router, get_request("/api/games?ids=3")).await;
    assert_eq!(x_cache(&untouched), Some("HIT"));
}
