//! Agent-facing dispatch protocol

use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::JobStatus;
use convoy_core::domain::lease::{Lease, LeaseClaim};
use convoy_core::dto::job::Work;
use convoy_core::dto::rpc::{
    AGENT_ID_HEADER, CompleteResponse, LEASE_TOKEN_HEADER, LogBatch, NextRequest, StateReport,
    WaitOutcome, WaitResponse,
};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use uuid::Uuid;

use crate::QueueClient;
use crate::error::Result;

impl QueueClient {
    /// Long-polls for work; `None` when the poll window closed empty
    pub async fn next(&self, req: &NextRequest) -> Result<Option<Work>> {
        let response = self.long_poll("/api/rpc/next").json(req).send().await?;

        if response.status() == StatusCode::NO_CONTENT {
            tracing::trace!(agent_id = %req.agent_id, "No work available");
            return Ok(None);
        }
        Self::handle_response(response).await.map(Some)
    }

    /// Long-polls for cancellation of a job
    pub async fn wait(&self, job_id: Uuid) -> Result<WaitOutcome> {
        let path = format!("/api/rpc/jobs/{}/wait", job_id);
        let response = self.long_poll(&path).send().await?;

        let body: WaitResponse = Self::handle_response(response).await?;
        Ok(body.outcome)
    }

    /// Renews the lease of a job
    pub async fn extend(&self, job_id: Uuid, claim: &LeaseClaim) -> Result<Lease> {
        let path = format!("/api/rpc/jobs/{}/extend", job_id);
        let response = self.post(&path).json(claim).send().await?;

        let lease: Lease = Self::handle_response(response).await?;
        tracing::trace!(job_id = %job_id, expires_at = %lease.expires_at, "Lease renewed");
        Ok(lease)
    }

    /// Reports an intermediate execution state
    pub async fn update(&self, job_id: Uuid, report: &StateReport) -> Result<()> {
        let path = format!("/api/rpc/jobs/{}/update", job_id);
        let response = self.post(&path).json(report).send().await?;

        Self::handle_empty_response(response).await
    }

    /// Reports the final execution state, returning the derived job status
    pub async fn complete(&self, job_id: Uuid, report: &StateReport) -> Result<JobStatus> {
        let path = format!("/api/rpc/jobs/{}/complete", job_id);
        let response = self.post(&path).json(report).send().await?;

        let body: CompleteResponse = Self::handle_response(response).await?;
        Ok(body.status)
    }

    /// Sends a batch of log lines
    pub async fn send_logs(&self, job_id: Uuid, batch: &LogBatch) -> Result<()> {
        let path = format!("/api/rpc/jobs/{}/logs", job_id);
        let response = self.post(&path).json(batch).send().await?;

        Self::handle_empty_response(response).await
    }

    /// Uploads the artifact of a step
    pub async fn upload_artifact(
        &self,
        job_id: Uuid,
        step: &str,
        claim: &LeaseClaim,
        name: &str,
        mime: &str,
        data: Vec<u8>,
    ) -> Result<Artifact> {
        let path = format!("/api/rpc/jobs/{}/artifacts/{}", job_id, step);
        let response = self
            .post(&path)
            .query(&[("name", name)])
            .header(AGENT_ID_HEADER, claim.agent_id.as_str())
            .header(LEASE_TOKEN_HEADER, claim.token.to_string())
            .header(CONTENT_TYPE, mime)
            .body(data)
            .send()
            .await?;

        Self::handle_response(response).await
    }
}
