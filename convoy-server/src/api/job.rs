//! Job API Handlers
//!
//! Operator-facing endpoints: enqueue, cancel and inspect jobs.

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::Job;
use convoy_core::domain::log::LogLine;
use convoy_core::dto::job::CreateJob;
use convoy_core::dto::rpc::QueueStats;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

const REDACTED: &str = "********";

/// Secret values never leave the server through the operator API
fn redact(mut job: Job) -> Job {
    for secret in &mut job.secrets {
        secret.value = REDACTED.to_string();
    }
    job
}

/// POST /api/jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    tracing::info!("Enqueueing job for pipeline: {}", req.pipeline.name);

    let job = state.queue.push(req.into_job()).await?;
    Ok((StatusCode::CREATED, Json(redact(job))))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    state.queue.cancel(id).await?;
    let job = state.queue.find(id).await?;
    Ok(Json(redact(job)))
}

/// GET /api/jobs
/// Jobs still held in memory; finished jobs drop out after the retention window
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.queue.list().into_iter().map(redact).collect())
}

/// GET /api/jobs/{id}
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = state.queue.find(id).await?;
    Ok(Json(redact(job)))
}

/// GET /api/jobs/{id}/logs
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogLine>>> {
    Ok(Json(state.queue.logs(id).await?))
}

/// GET /api/jobs/{id}/artifacts
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Artifact>>> {
    Ok(Json(state.queue.artifacts(id).await?))
}

/// GET /api/jobs/{id}/artifacts/{step}
/// Returns the raw artifact with its MIME type
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((id, step)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let (artifact, data) = state
        .queue
        .artifact(id, &step)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No artifact for step '{}' of job {}", step, id)))?;

    Ok(([(CONTENT_TYPE, artifact.mime)], data))
}

/// GET /api/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}
