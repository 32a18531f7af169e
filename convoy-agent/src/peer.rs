//! Connection between an agent and the queue
//!
//! [`Peer`] is the dispatch protocol as seen by the agent. The HTTP client
//! implements it for production; tests drive an in-process queue through it.

use async_trait::async_trait;
use convoy_client::{ClientError, QueueClient};
use convoy_core::domain::job::JobStatus;
use convoy_core::domain::lease::{Lease, LeaseClaim};
use convoy_core::dto::job::Work;
use convoy_core::dto::rpc::{LogBatch, NextRequest, StateReport, WaitOutcome};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// Network or server failure, worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// The agent no longer holds the lease of the job
    #[error("lease lost")]
    LeaseLost,

    #[error("not found: {0}")]
    NotFound(String),

    /// The server refused the request; retrying will not help
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("{op} failed after {attempts} attempts: {message}")]
    Exhausted {
        op: &'static str,
        attempts: u32,
        message: String,
    },
}

impl PeerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PeerError::Transient(_))
    }
}

impl From<ClientError> for PeerError {
    fn from(err: ClientError) -> Self {
        if err.is_lease_lost() {
            PeerError::LeaseLost
        } else if err.is_not_found() {
            PeerError::NotFound(err.to_string())
        } else if err.is_transient() {
            PeerError::Transient(err.to_string())
        } else {
            PeerError::Rejected(err.to_string())
        }
    }
}

/// A step artifact on its way to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUpload {
    pub step: String,
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Peer: Send + Sync {
    /// Long-polls for work matching the agent's labels
    async fn next(&self, req: &NextRequest) -> Result<Option<Work>, PeerError>;

    /// Long-polls until the job is cancelled, finished or revoked
    async fn wait(&self, job_id: Uuid) -> Result<WaitOutcome, PeerError>;

    async fn extend(&self, job_id: Uuid, claim: &LeaseClaim) -> Result<Lease, PeerError>;

    async fn update(&self, job_id: Uuid, report: &StateReport) -> Result<(), PeerError>;

    async fn complete(&self, job_id: Uuid, report: &StateReport) -> Result<JobStatus, PeerError>;

    async fn send_logs(&self, job_id: Uuid, batch: &LogBatch) -> Result<(), PeerError>;

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        artifact: &ArtifactUpload,
    ) -> Result<(), PeerError>;
}

#[async_trait]
impl Peer for QueueClient {
    async fn next(&self, req: &NextRequest) -> Result<Option<Work>, PeerError> {
        Ok(QueueClient::next(self, req).await?)
    }

    async fn wait(&self, job_id: Uuid) -> Result<WaitOutcome, PeerError> {
        Ok(QueueClient::wait(self, job_id).await?)
    }

    async fn extend(&self, job_id: Uuid, claim: &LeaseClaim) -> Result<Lease, PeerError> {
        Ok(QueueClient::extend(self, job_id, claim).await?)
    }

    async fn update(&self, job_id: Uuid, report: &StateReport) -> Result<(), PeerError> {
        Ok(QueueClient::update(self, job_id, report).await?)
    }

    async fn complete(&self, job_id: Uuid, report: &StateReport) -> Result<JobStatus, PeerError> {
        Ok(QueueClient::complete(self, job_id, report).await?)
    }

    async fn send_logs(&self, job_id: Uuid, batch: &LogBatch) -> Result<(), PeerError> {
        Ok(QueueClient::send_logs(self, job_id, batch).await?)
    }

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        artifact: &ArtifactUpload,
    ) -> Result<(), PeerError> {
        QueueClient::upload_artifact(
            self,
            job_id,
            &artifact.step,
            claim,
            &artifact.name,
            &artifact.mime,
            artifact.data.clone(),
        )
        .await?;
        Ok(())
    }
}
