//! Cache administration endpoints.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    application::error::HttpError,
    cache::{
        CacheContext, EventKind, HealthReport, HealthStatus, InvalidationStrategy,
        MetricsSnapshot,
    },
};

use super::middleware::{log_responses, set_request_context};

const SOURCE: &str = "infra::http::admin";

#[derive(Clone)]
pub struct AdminState {
    pub cache: CacheContext,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/cache/metrics", get(cache_metrics))
        .route("/admin/cache/health", get(cache_health))
        .route("/admin/cache/invalidate", post(invalidate))
        .route("/admin/cache/clear", post(clear))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn healthz() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Serialize)]
struct LayerMetrics {
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
    pending_invalidations: usize,
    in_flight: usize,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    object: LayerMetrics,
    response: LayerMetrics,
    revalidating: usize,
}

async fn cache_metrics(State(state): State<AdminState>) -> Json<MetricsResponse> {
    let objects = state.cache.objects();
    let responses = state.cache.responses();

    Json(MetricsResponse {
        object: LayerMetrics {
            snapshot: objects.metrics(),
            pending_invalidations: objects.pending_invalidations(),
            in_flight: objects.in_flight(),
        },
        response: LayerMetrics {
            snapshot: responses.cache().metrics(),
            pending_invalidations: responses.cache().pending_invalidations(),
            in_flight: responses.cache().in_flight(),
        },
        revalidating: responses.revalidating().len(),
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    layers: Vec<HealthReport>,
}

async fn cache_health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let layers = vec![
        state.cache.objects().health(),
        state.cache.responses().cache().health(),
    ];
    let status = if layers
        .iter()
        .any(|layer| layer.status == HealthStatus::Degraded)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    Json(HealthResponse { status, layers })
}

/// Which layer a single-key invalidation targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Layer {
    #[default]
    Object,
    Response,
}

/// Exactly one of `tags`, `key` or `event` must be set.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InvalidateRequest {
    tags: Option<Vec<String>>,
    key: Option<String>,
    strategy: InvalidationStrategy,
    layer: Layer,
    event: Option<EventKind>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
struct InvalidateResponse {
    removed: usize,
    queued: bool,
}

async fn invalidate(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, HttpError> {
    let InvalidateRequest {
        tags,
        key,
        strategy,
        layer,
        event,
    } = request;

    let response = match (tags, key, event) {
        (Some(tags), None, None) if !tags.is_empty() => {
            let removed = state.cache.objects().invalidate_by_tags(&tags)
                + state.cache.responses().cache().invalidate_by_tags(&tags);
            InvalidateResponse {
                removed,
                queued: false,
            }
        }
        (None, Some(key), None) if !key.is_empty() => {
            let removed = match layer {
                Layer::Object => state.cache.objects().invalidate(&key, strategy),
                Layer::Response => state.cache.responses().cache().invalidate(&key, strategy),
            };
            InvalidateResponse {
                removed: usize::from(removed),
                queued: matches!(
                    strategy,
                    InvalidationStrategy::Lazy | InvalidationStrategy::Background
                ),
            }
        }
        (None, None, Some(event)) => InvalidateResponse {
            removed: state.cache.trigger().trigger(&event).total(),
            queued: false,
        },
        _ => {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Invalid invalidation request",
                "exactly one of `tags`, `key` or `event` must be provided",
            ));
        }
    };

    info!(
        removed = response.removed,
        queued = response.queued,
        "Admin cache invalidation"
    );
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    cleared: usize,
}

async fn clear(State(state): State<AdminState>) -> Json<ClearResponse> {
    Json(ClearResponse {
        cleared: state.cache.clear(),
    })
}
