//! HTTP response cache middleware.
//!
//! Caches `GET` responses for routes that have a [`RoutePolicy`]. Servable
//! entries answer conditional requests with `304 Not Modified`; stale
//! entries are served immediately while one background request per key
//! refreshes them. Streaming responses, responses that set cookies and
//! non-2xx responses are never stored.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::config::{CacheConfig, ResponseCachePolicy, RoutePolicy};
use super::error::FingerprintError;
use super::fingerprint::{fingerprint_bytes, if_none_match_matches};
use super::freshness::Freshness;
use super::keys::RequestKey;
use super::orchestrator::{CacheOrchestrator, CacheStatus};
use super::store::{CacheEntry, parse_http_date};

/// Diagnostic header carrying the [`CacheStatus`].
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Headers the cache sets itself; stored copies are dropped on replay.
const MANAGED_HEADERS: [HeaderName; 4] = [
    header::ETAG,
    header::LAST_MODIFIED,
    header::CACHE_CONTROL,
    X_CACHE,
];

/// A buffered response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers: headers
                .iter()
                .filter(|(name, _)| !MANAGED_HEADERS.contains(*name))
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect(),
            body,
        }
    }
}

/// Responses are identified by their body bytes.
pub fn response_fingerprint(response: &CachedResponse) -> Result<String, FingerprintError> {
    Ok(fingerprint_bytes(&response.body))
}

/// Keys whose stale entry is currently being refreshed.
#[derive(Default, Clone)]
pub struct InFlightRevalidations {
    keys: Arc<DashMap<String, ()>>,
}

impl InFlightRevalidations {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a revalidation for `key` is already running.
    pub fn acquire(&self, key: &str) -> Option<RevalidationGuard> {
        use dashmap::mapref::entry::Entry;

        match self.keys.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(RevalidationGuard {
                    key: key.to_string(),
                    keys: Arc::clone(&self.keys),
                })
            }
            Entry::Occupied(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct RevalidationGuard {
    key: String,
    keys: Arc<DashMap<String, ()>>,
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

/// Shared state for [`response_cache_layer`].
#[derive(Clone)]
pub struct ResponseCacheState {
    enabled: bool,
    body_limit: usize,
    policies: Arc<ResponseCachePolicy>,
    cache: CacheOrchestrator<CachedResponse>,
    revalidating: InFlightRevalidations,
}

impl ResponseCacheState {
    pub fn new(config: &CacheConfig, cache: CacheOrchestrator<CachedResponse>) -> Self {
        Self {
            enabled: config.enable_response_cache,
            body_limit: config.response_body_limit_bytes,
            policies: Arc::new(config.response_policies()),
            cache,
            revalidating: InFlightRevalidations::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache(&self) -> &CacheOrchestrator<CachedResponse> {
        &self.cache
    }

    pub fn revalidating(&self) -> &InFlightRevalidations {
        &self.revalidating
    }

    async fn store(
        &self,
        key: String,
        uri: &Uri,
        policy: &RoutePolicy,
        response: Response,
    ) -> Response {
        if !should_store_response(&response) {
            debug!(
                cache = "response",
                key = %key,
                outcome = "skip",
                status = %response.status(),
                "response not cacheable"
            );
            return with_status(response, CacheStatus::Miss);
        }
        if exceeds_limit(&response, self.body_limit) {
            debug!(
                cache = "response",
                key = %key,
                outcome = "skip",
                "response larger than body limit"
            );
            return with_status(response, CacheStatus::Miss);
        }

        let (rebuilt, cached) = match buffer_response(response).await {
            Ok(buffered) => buffered,
            Err((rebuilt, error)) => {
                warn!(cache = "response", key = %key, error = %error, "failed to buffer response");
                return rebuilt;
            }
        };
        if cached.body.len() > self.body_limit {
            return with_status(rebuilt, CacheStatus::Miss);
        }

        match self
            .cache
            .store()
            .set(key.clone(), cached, &policy.entry_options(uri.path(), uri.query()))
        {
            Ok(entry) => {
                debug!(
                    cache = "response",
                    key = %key,
                    outcome = "stored",
                    "caching response"
                );
                replay(&entry, policy, CacheStatus::Miss)
            }
            Err(error) => {
                warn!(cache = "response", key = %key, error = %error, "failed to cache response");
                with_status(rebuilt, CacheStatus::Miss)
            }
        }
    }

    /// Refresh a stale entry off the request path. At most one refresh per
    /// key runs at a time; the request is replayed without its conditional
    /// headers so the handler always produces a full body.
    fn spawn_revalidation(
        &self,
        key: String,
        request: &Request<Body>,
        next: Next,
        policy: RoutePolicy,
    ) {
        let Some(guard) = self.revalidating.acquire(&key) else {
            debug!(
                cache = "response",
                key = %key,
                outcome = "joined",
                "revalidation already running"
            );
            return;
        };

        let uri = request.uri().clone();
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(request.uri().clone())
            .version(request.version());
        for (name, value) in request.headers() {
            if name != header::IF_NONE_MATCH && name != header::IF_MODIFIED_SINCE {
                builder = builder.header(name, value);
            }
        }
        let fresh_request = match builder.body(Body::empty()) {
            Ok(fresh_request) => fresh_request,
            Err(error) => {
                warn!(cache = "response", key = %key, error = %error, "failed to rebuild request");
                return;
            }
        };

        let state = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let response = next.run(fresh_request).await;
            let status = response.status();
            let refreshed = state.store(key.clone(), &uri, &policy, response).await;
            if refreshed.headers().contains_key(header::ETAG) {
                debug!(
                    cache = "response",
                    key = %key,
                    outcome = "revalidated",
                    "stale response refreshed"
                );
            } else {
                warn!(
                    cache = "response",
                    key = %key,
                    status = %status,
                    outcome = "refresh_failed",
                    "stale response not refreshed"
                );
            }
        });
    }
}

/// Middleware for the response cache.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<ResponseCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.enabled
        || request.method() != Method::GET
        || accepts_event_stream(request.headers())
    {
        return next.run(request).await;
    }

    let uri = request.uri().clone();
    let Some(policy) = cache.policies.match_path(uri.path()).cloned() else {
        return next.run(request).await;
    };

    cache.cache.consume_lazy();
    let key = RequestKey::derive(request.method(), request.uri(), request.headers(), &policy)
        .into_string();

    if let Some(lookup) = cache.cache.store().get(&key) {
        match lookup.freshness {
            Freshness::Fresh if is_not_modified(request.headers(), &lookup.entry) => {
                debug!(cache = "response", key = %key, outcome = "not_modified", "conditional hit");
                return not_modified(&lookup.entry, &policy, CacheStatus::Hit);
            }
            Freshness::Fresh => {
                debug!(cache = "response", key = %key, outcome = "hit", "serving cached response");
                return replay(&lookup.entry, &policy, CacheStatus::Hit);
            }
            Freshness::Stale => {
                debug!(cache = "response", key = %key, outcome = "stale", "serving stale response");
                let response = if is_not_modified(request.headers(), &lookup.entry) {
                    not_modified(&lookup.entry, &policy, CacheStatus::Stale)
                } else {
                    replay(&lookup.entry, &policy, CacheStatus::Stale)
                };
                cache.spawn_revalidation(key, &request, next, policy);
                return response;
            }
            Freshness::Expired => {}
        }
    }

    debug!(cache = "response", key = %key, outcome = "miss", "cache miss, executing handler");
    let response = next.run(request).await;
    cache.store(key, &uri, &policy, response).await
}

pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    !is_event_stream(response.headers().get(header::CONTENT_TYPE))
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    is_event_stream(headers.get(header::ACCEPT))
}

fn is_event_stream(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

fn exceeds_limit(response: &Response, limit: usize) -> bool {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_some_and(|length| length > limit)
}

/// `If-None-Match` wins over `If-Modified-Since` when both are present.
fn is_not_modified(headers: &HeaderMap, entry: &CacheEntry<CachedResponse>) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        return value
            .to_str()
            .is_ok_and(|value| if_none_match_matches(value, &entry.fingerprint));
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| entry.created_at.unix_timestamp() <= since.unix_timestamp())
}

async fn buffer_response(
    response: Response,
) -> Result<(Response, CachedResponse), (Response, String)> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
            Ok((Response::from_parts(parts, Body::from(bytes)), cached))
        }
        Err(error) => {
            let rebuilt = Response::from_parts(parts, Body::empty());
            Err((
                with_status(rebuilt, CacheStatus::Miss),
                format!("failed to buffer response body: {error}"),
            ))
        }
    }
}

fn replay(
    entry: &CacheEntry<CachedResponse>,
    policy: &RoutePolicy,
    status: CacheStatus,
) -> Response {
    let cached = &entry.value;
    let mut response = Response::new(Body::from(cached.body.clone()));
    *response.status_mut() = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    apply_cache_headers(headers, entry, policy, status);
    response
}

fn not_modified(
    entry: &CacheEntry<CachedResponse>,
    policy: &RoutePolicy,
    status: CacheStatus,
) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    apply_cache_headers(response.headers_mut(), entry, policy, status);
    response
}

fn apply_cache_headers(
    headers: &mut HeaderMap,
    entry: &CacheEntry<CachedResponse>,
    policy: &RoutePolicy,
    status: CacheStatus,
) {
    let pairs = [
        (header::ETAG, entry.fingerprint.clone()),
        (header::LAST_MODIFIED, entry.last_modified()),
        (header::CACHE_CONTROL, policy.cache_control()),
        (X_CACHE, status.as_str().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn with_status(mut response: Response, status: CacheStatus) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode, headers: &[(HeaderName, &'static str)]) -> Response {
        let mut response = Response::new(Body::from("body"));
        *response.status_mut() = status;
        for (name, value) in headers {
            response
                .headers_mut()
                .insert(name.clone(), HeaderValue::from_static(value));
        }
        response
    }

    #[test]
    fn only_plain_successes_are_stored() {
        assert!(should_store_response(&response(StatusCode::OK, &[])));
        assert!(!should_store_response(&response(StatusCode::BAD_GATEWAY, &[])));
        assert!(!should_store_response(&response(
            StatusCode::OK,
            &[(header::SET_COOKIE, "session=1")]
        )));
        assert!(!should_store_response(&response(
            StatusCode::OK,
            &[(header::CONTENT_TYPE, "text/event-stream")]
        )));
    }

    #[test]
    fn content_length_over_limit_is_detected() {
        let big = response(StatusCode::OK, &[(header::CONTENT_LENGTH, "2048")]);
        assert!(exceeds_limit(&big, 1024));
        assert!(!exceeds_limit(&big, 4096));
        assert!(!exceeds_limit(&response(StatusCode::OK, &[]), 1));
    }

    #[test]
    fn managed_headers_are_not_stored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_static("\"upstream\""));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let cached = CachedResponse::new(StatusCode::OK, &headers, Bytes::from_static(b"{}"));
        assert_eq!(
            cached.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn revalidation_guard_releases_on_drop() {
        let inflight = InFlightRevalidations::new();
        let guard = inflight.acquire("GET /api/games/1").expect("first acquire");
        assert!(inflight.acquire("GET /api/games/1").is_none());
        assert_eq!(inflight.len(), 1);

        drop(guard);
        assert!(inflight.is_empty());
        assert!(inflight.acquire("GET /api/games/1").is_some());
    }
}
