use super::error::ApiError;
use super::state::ApiState;
use crate::job::{Job, JobMetrics};
use crate::orchestrator::ProgressUpdate;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartIndexingRequest {
    file_id: String,
    file_name: String,
    #[serde(default)]
    force_rebuild: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartIndexingResponse {
    job_id: String,
}

#[derive(Serialize)]
pub(super) struct JobsResponse {
    jobs: Vec<Job>,
    total: usize,
}

#[derive(Serialize)]
pub(super) struct CancelResponse {
    cancelled: bool,
}

/// Body posted by the worker when it finishes.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CallbackRequest {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    metrics: JobMetrics,
}

pub(super) async fn start_indexing(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<StartIndexingRequest>,
) -> Result<(StatusCode, Json<StartIndexingResponse>), ApiError> {
    let job_id = state
        .orchestrator
        .start_indexing(&request.file_id, &request.file_name, request.force_rebuild)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartIndexingResponse { job_id })))
}

pub(super) async fn list_jobs(State(state): State<Arc<ApiState>>) -> Json<JobsResponse> {
    let jobs = state.orchestrator.list_jobs().await;
    let total = jobs.len();
    Json(JobsResponse { jobs, total })
}

pub(super) async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.get_job(&job_id).await?))
}

pub(super) async fn cancel_job(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.orchestrator.cancel_job(&job_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

pub(super) async fn job_callback(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
    Json(request): Json<CallbackRequest>,
) -> Result<Json<Job>, ApiError> {
    let metrics = (!request.metrics.is_empty()).then_some(request.metrics);
    let job = state
        .orchestrator
        .update_job_from_callback(&job_id, request.success, request.error, metrics)
        .await?;
    Ok(Json(job))
}

pub(super) async fn job_progress(
    State(state): State<Arc<ApiState>>,
    Path(job_id): Path<String>,
    Json(update): Json<ProgressUpdate>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.record_progress(&job_id, update).await?))
}
