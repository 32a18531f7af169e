//! Agent RPC Handlers
//!
//! The wire side of the dispatch protocol: long-poll for work, watch for
//! cancellation, renew leases, and report state, logs and artifacts.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::lease::{Lease, LeaseClaim};
use convoy_core::dto::rpc::{
    AGENT_ID_HEADER, ArtifactQuery, CompleteResponse, LEASE_TOKEN_HEADER, LogBatch, NextRequest,
    StateReport, WaitOutcome, WaitResponse,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /api/rpc/next
/// Long-polls for a job; 204 when none arrived in time
pub async fn next(State(state): State<AppState>, Json(req): Json<NextRequest>) -> ApiResult<Response> {
    if req.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id cannot be empty".to_string()));
    }

    tracing::debug!(agent_id = %req.agent_id, "Agent polling for work");

    match state.queue.pull(&req.agent_id, &req.labels, state.pull_wait).await {
        Some(work) => Ok(Json(work).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /api/rpc/jobs/{id}/wait
/// Blocks until the job is cancelled, finished or revoked, or the poll
/// window closes
pub async fn wait(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<WaitResponse>> {
    let outcome = match tokio::time::timeout(state.wait_poll, state.queue.wait_for_cancel(id)).await {
        Ok(outcome) => outcome?,
        Err(_) => WaitOutcome::Pending,
    };

    Ok(Json(WaitResponse { outcome }))
}

/// POST /api/rpc/jobs/{id}/extend
pub async fn extend(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(claim): Json<LeaseClaim>,
) -> ApiResult<Json<Lease>> {
    let lease = state.queue.extend(id, &claim)?;
    tracing::debug!(job_id = %id, agent_id = %claim.agent_id, "Lease extended");
    Ok(Json(lease))
}

/// POST /api/rpc/jobs/{id}/update
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<StateReport>,
) -> ApiResult<StatusCode> {
    state.queue.update(id, &report.claim, report.state).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/rpc/jobs/{id}/complete
pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<StateReport>,
) -> ApiResult<Json<CompleteResponse>> {
    let status = state.queue.complete(id, &report.claim, report.state).await?;
    Ok(Json(CompleteResponse { status }))
}

/// POST /api/rpc/jobs/{id}/logs
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(batch): Json<LogBatch>,
) -> ApiResult<StatusCode> {
    tracing::debug!(job_id = %id, "Received {} log line(s)", batch.lines.len());
    state.queue.append_logs(id, &batch.claim, &batch.lines).await?;
    Ok(StatusCode::CREATED)
}

/// Lease claim of an upload, read from the `x-convoy-*` headers
fn header_claim(headers: &HeaderMap) -> ApiResult<LeaseClaim> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", name)))
    };

    let agent_id = value(AGENT_ID_HEADER)?.to_string();
    let token = value(LEASE_TOKEN_HEADER)?
        .parse::<Uuid>()
        .map_err(|_| ApiError::BadRequest(format!("invalid {} header", LEASE_TOKEN_HEADER)))?;
    Ok(LeaseClaim { agent_id, token })
}

/// POST /api/rpc/jobs/{id}/artifacts/{step}
/// Raw body upload; the MIME type comes from `Content-Type`, the lease
/// claim from the `x-convoy-agent-id` and `x-convoy-lease-token` headers
pub async fn save_artifact(
    State(state): State<AppState>,
    Path((id, step)): Path<(Uuid, String)>,
    Query(query): Query<ArtifactQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Artifact>)> {
    let mime = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let claim = header_claim(&headers)?;

    let artifact = state
        .queue
        .save_artifact(id, &claim, &step, &query.name, mime, &body)
        .await?;

    Ok((StatusCode::CREATED, Json(artifact)))
}
