//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use mview::MviewBackend;
use serde::Serialize;

use super::views::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub views: usize,
}

/// GET /health: liveness and the number of served views.
pub async fn check<B: MviewBackend>(State(state): State<Arc<AppState<B>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        views: state.processor.views().len(),
    })
}
