//! Refresh daemon for materialized views.
//!
//! Runs scheduled refreshes and changelog pruning in the background and
//! serves an admin surface for view status and manual refreshes, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use mview::{MviewBackend, MviewDeclarations};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use error::DaemonError;
use routes::views::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<B: MviewBackend>(
    state: Arc<AppState<B>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<B>))
        .route("/views", get(routes::views::list::<B>))
        .route("/views/{id}", get(routes::views::get::<B>))
        .route("/views/{id}/refresh", post(routes::views::refresh::<B>))
        .route("/views/{id}/reindex", post(routes::views::reindex::<B>))
        .route("/refresh", post(routes::views::refresh_all::<B>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Reads view declarations from a JSON file.
pub fn load_declarations(path: &Path) -> Result<MviewDeclarations, DaemonError> {
    let json = std::fs::read_to_string(path).map_err(|source| DaemonError::Declarations {
        path: path.display().to_string(),
        source,
    })?;
    Ok(MviewDeclarations::from_json(&json)?)
}
