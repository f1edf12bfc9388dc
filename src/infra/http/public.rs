use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    application::{
        catalog::{CatalogService, MAX_BATCH},
        error::HttpError,
    },
    cache::{ResponseCacheState, response_cache_layer},
};

use super::{
    middleware::{log_responses, set_request_context},
    parse_strategy,
};

const SOURCE: &str = "infra::http::public";

#[derive(Clone)]
pub struct HttpState {
    pub catalog: CatalogService,
}

/// Public API. Every route passes through the response cache; routes without
/// a cache policy are forwarded untouched.
pub fn build_router(state: HttpState, cache: ResponseCacheState) -> Router {
    Router::new()
        .route("/api/games", get(list_games))
        .route("/api/games/{id}", get(show_game))
        .with_state(state)
        .layer(middleware::from_fn_with_state(cache, response_cache_layer))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
struct GameQuery {
    strategy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GamesQuery {
    ids: Option<String>,
    strategy: Option<String>,
}

async fn show_game(
    State(state): State<HttpState>,
    Path(raw_id): Path<String>,
    Query(query): Query<GameQuery>,
) -> Result<Response, HttpError> {
    let id = parse_id(&raw_id)?;
    let strategy = parse_strategy(SOURCE, query.strategy.as_deref())?;
    let resolved = state.catalog.game(id, strategy).await?;
    Ok(Json(resolved.value).into_response())
}

async fn list_games(
    State(state): State<HttpState>,
    Query(query): Query<GamesQuery>,
) -> Result<Json<Vec<Option<Value>>>, HttpError> {
    let ids = parse_ids(query.ids.as_deref().unwrap_or(""))?;
    let strategy = parse_strategy(SOURCE, query.strategy.as_deref())?;
    let games = state.catalog.games(&ids, strategy).await?;
    Ok(Json(games))
}

fn parse_id(raw: &str) -> Result<u64, HttpError> {
    raw.trim().parse::<u64>().map_err(|_| {
        HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Invalid game id",
            format!("`{raw}` is not a game id"),
        )
    })
}

fn parse_ids(raw: &str) -> Result<Vec<u64>, HttpError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_id)
        .collect::<Result<Vec<_>, _>>()?;

    if ids.is_empty() {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Missing game ids",
            "`ids` must list at least one game id",
        ));
    }
    if ids.len() > MAX_BATCH {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Too many game ids",
            format!("{} ids requested, at most {MAX_BATCH} allowed", ids.len()),
        ));
    }
    Ok(ids)
}
