use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::catalog::CatalogError,
    cache::{CacheError, FetchError},
    config::LoadError,
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn report(&self) -> &ErrorReport {
        &self.report
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<CacheError> for HttpError {
    fn from(error: CacheError) -> Self {
        const SOURCE: &str = "application::error::cache_error_to_http_error";
        match &error {
            CacheError::Fetch {
                source: FetchError::Timeout { .. },
                ..
            } => HttpError::from_error(
                SOURCE,
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream request timed out",
                &error,
            ),
            CacheError::Fetch { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream request failed",
                &error,
            ),
            CacheError::Fingerprint { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

impl From<CatalogError> for HttpError {
    fn from(error: CatalogError) -> Self {
        const SOURCE: &str = "application::error::catalog_error_to_http_error";
        match error {
            CatalogError::BatchTooLarge { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Request could not be processed",
                &error,
            ),
            CatalogError::NotCached(_) => HttpError::from_error(
                SOURCE,
                StatusCode::NOT_FOUND,
                "Resource not cached",
                &error,
            ),
            CatalogError::NotFound(_) => HttpError::from_error(
                SOURCE,
                StatusCode::NOT_FOUND,
                "Resource not found",
                &error,
            ),
            CatalogError::Cache(err) => HttpError::from(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Infra(InfraError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_) | AppError::Config(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Request could not be processed",
            AppError::Infra(InfraError::Upstream { .. }) => "Upstream request failed",
            AppError::Config(_) => "Service misconfigured",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FingerprintError;

    #[test]
    fn upstream_failures_map_to_gateway_errors() {
        let failed: HttpError =
            CacheError::fetch("game:1", FetchError::status(503, "unavailable")).into();
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(failed.report().messages.len(), 2);

        let timed_out: HttpError =
            CacheError::fetch("game:1", FetchError::Timeout { timeout_ms: 10 }).into();
        assert_eq!(timed_out.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn catalog_errors_are_not_conflated() {
        let not_found: HttpError = CatalogError::NotFound(9).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let too_large: HttpError = CatalogError::BatchTooLarge { count: 500 }.into();
        assert_eq!(too_large.status(), StatusCode::BAD_REQUEST);

        let unstable: HttpError =
            CatalogError::Cache(CacheError::fingerprint("game:1", FingerprintError::new("nan")))
                .into();
        assert_eq!(unstable.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn startup_errors_map_to_statuses() {
        let misconfigured = AppError::from(LoadError::Invalid {
            key: "cache.degraded_utilization",
            reason: "must be within 0..=1".to_string(),
        });
        assert_eq!(misconfigured.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(misconfigured.presentation_message(), "Service misconfigured");

        let upstream = AppError::from(InfraError::upstream("client build failed"));
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.presentation_message(), "Upstream request failed");
    }

    #[test]
    fn error_report_is_attached_to_response() {
        let response = HttpError::new(
            "tests",
            StatusCode::BAD_REQUEST,
            "Request could not be processed",
            "bad id",
        )
        .into_response();

        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.messages, vec!["bad id".to_string()]);
    }
}
