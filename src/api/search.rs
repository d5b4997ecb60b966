use super::error::ApiError;
use super::state::ApiState;
use crate::orchestrator::SearchResult;
use crate::orchestrator::search::SearchRequest;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SearchAllRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    min_score: Option<f32>,
}

#[derive(Serialize)]
pub(super) struct SearchResponse {
    results: Vec<SearchResult>,
}

pub(super) async fn search(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let results = state.orchestrator.search_vector(&request).await?;
    Ok(Json(SearchResponse { results }))
}

pub(super) async fn search_all(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SearchAllRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let results = state
        .orchestrator
        .search_all_manuals(&request.query, request.k, request.min_score)
        .await?;
    Ok(Json(SearchResponse { results }))
}
