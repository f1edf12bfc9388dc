mod admin;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use public::{HttpState, build_router};

use std::str::FromStr;

use axum::http::StatusCode;

use crate::application::error::HttpError;
use crate::cache::FetchStrategy;

/// Parse an optional `?strategy=` value, defaulting to cache-first.
fn parse_strategy(source: &'static str, raw: Option<&str>) -> Result<FetchStrategy, HttpError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(FetchStrategy::default()),
        Some(value) => FetchStrategy::from_str(value).map_err(|_| {
            HttpError::new(
                source,
                StatusCode::BAD_REQUEST,
                "Unknown fetch strategy",
                format!("`{value}` is not a fetch strategy"),
            )
        }),
    }
}
