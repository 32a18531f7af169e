//! Operator-facing job management

use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::Job;
use convoy_core::domain::log::LogLine;
use convoy_core::dto::job::CreateJob;
use convoy_core::dto::rpc::QueueStats;
use reqwest::header::CONTENT_TYPE;
use uuid::Uuid;

use crate::QueueClient;
use crate::error::Result;

impl QueueClient {
    /// Enqueue a new job
    pub async fn create_job(&self, req: CreateJob) -> Result<Job> {
        let response = self.post("/api/jobs").json(&req).send().await?;

        Self::handle_response(response).await
    }

    /// List all jobs, newest first
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let response = self.get("/api/jobs").send().await?;

        Self::handle_response(response).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let response = self.get(&format!("/api/jobs/{}", job_id)).send().await?;

        Self::handle_response(response).await
    }

    /// Request cancellation of a job
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let response = self
            .post(&format!("/api/jobs/{}/cancel", job_id))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Get the log lines of a job
    pub async fn get_job_logs(&self, job_id: Uuid) -> Result<Vec<LogLine>> {
        let response = self.get(&format!("/api/jobs/{}/logs", job_id)).send().await?;

        Self::handle_response(response).await
    }

    /// List the artifacts of a job
    pub async fn list_artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        let response = self
            .get(&format!("/api/jobs/{}/artifacts", job_id))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Download the artifact of a step, returning its MIME type and payload
    pub async fn download_artifact(&self, job_id: Uuid, step: &str) -> Result<(String, Vec<u8>)> {
        let response = self
            .get(&format!("/api/jobs/{}/artifacts/{}", job_id, step))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = response.bytes().await?;
        Ok((mime, data.to_vec()))
    }

    /// Queue occupancy counters
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let response = self.get("/api/queue/stats").send().await?;

        Self::handle_response(response).await
    }
}
