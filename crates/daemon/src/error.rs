//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mview::MviewError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Engine error.
    Mview(MviewError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Mview(err) => mview_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn mview_error_to_response(err: MviewError) -> (StatusCode, String) {
    match &err {
        MviewError::UnknownView(_) => (StatusCode::NOT_FOUND, err.to_string()),
        MviewError::RefreshInProgress(_) => (StatusCode::CONFLICT, err.to_string()),
        MviewError::Configuration(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        _ if err.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => {
            tracing::error!(error = %err, "internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<MviewError> for ApiError {
    fn from(err: MviewError) -> Self {
        ApiError::Mview(err)
    }
}

/// Errors that stop the daemon during startup.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("Cannot read {path}: {source}")]
    Declarations {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mview(#[from] MviewError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: MviewError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        assert_eq!(
            status_of(MviewError::UnknownView("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(MviewError::RefreshInProgress("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(MviewError::Configuration("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(MviewError::TransientStorage("dropped".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(MviewError::TableNotFound("sales_order".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
