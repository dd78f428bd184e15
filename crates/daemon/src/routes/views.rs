//! View status and refresh endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use mview::{MviewBackend, RefreshOutcome, RefreshReport, ViewProcessor, ViewRefresh, ViewStatus};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<B: MviewBackend> {
    pub processor: Arc<ViewProcessor<B>>,
}

#[derive(Deserialize)]
pub struct RefreshQuery {
    pub group: Option<String>,
}

#[derive(Serialize)]
pub struct RefreshAllResponse {
    pub views: Vec<ViewRefreshResponse>,
}

#[derive(Serialize)]
pub struct ViewRefreshResponse {
    pub view_id: String,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

impl From<ViewRefresh> for ViewRefreshResponse {
    fn from(refresh: ViewRefresh) -> Self {
        Self {
            view_id: refresh.view_id,
            outcome: refresh.outcome,
        }
    }
}

/// GET /views: status of every configured view.
#[tracing::instrument(skip(state))]
pub async fn list<B: MviewBackend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<Vec<ViewStatus>>, ApiError> {
    Ok(Json(state.processor.statuses().await?))
}

/// GET /views/{id}
#[tracing::instrument(skip(state))]
pub async fn get<B: MviewBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<ViewStatus>, ApiError> {
    let view = state.processor.view(&id)?;
    Ok(Json(view.status().await?))
}

/// POST /views/{id}/refresh: applies pending changes to one grid.
#[tracing::instrument(skip(state))]
pub async fn refresh<B: MviewBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<RefreshOutcome>, ApiError> {
    let view = state.processor.view(&id)?;
    Ok(Json(view.refresh_by_schedule().await?))
}

/// POST /views/{id}/reindex: rebuilds one grid from its source tables.
#[tracing::instrument(skip(state))]
pub async fn reindex<B: MviewBackend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<RefreshReport>, ApiError> {
    let view = state.processor.view(&id)?;
    Ok(Json(view.refresh_complete().await?))
}

/// POST /refresh?group=: scheduled refresh of every view, or of one group.
#[tracing::instrument(skip(state, query), fields(group = query.group.as_deref()))]
pub async fn refresh_all<B: MviewBackend>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<RefreshAllResponse>, ApiError> {
    let refreshed = state.processor.update(query.group.as_deref()).await?;
    Ok(Json(RefreshAllResponse {
        views: refreshed.into_iter().map(Into::into).collect(),
    }))
}
