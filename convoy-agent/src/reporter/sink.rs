//! Destinations for job output

use async_trait::async_trait;
use convoy_core::domain::lease::LeaseClaim;
use convoy_core::domain::log::LogLine;
use convoy_core::dto::rpc::LogBatch;
use std::sync::Arc;
use uuid::Uuid;

use crate::peer::{ArtifactUpload, Peer, PeerError};
use crate::retry::RetryPolicy;

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn append_lines(&self, job_id: Uuid, lines: Vec<LogLine>) -> Result<(), PeerError>;

    async fn upload_artifact(&self, job_id: Uuid, artifact: ArtifactUpload)
    -> Result<(), PeerError>;
}

/// Delivers output to the queue under the job's lease
pub struct PeerSink {
    peer: Arc<dyn Peer>,
    claim: LeaseClaim,
    retry: RetryPolicy,
}

impl PeerSink {
    pub fn new(peer: Arc<dyn Peer>, claim: LeaseClaim, retry: RetryPolicy) -> Self {
        Self { peer, claim, retry }
    }
}

#[async_trait]
impl ResultSink for PeerSink {
    async fn append_lines(&self, job_id: Uuid, lines: Vec<LogLine>) -> Result<(), PeerError> {
        let batch = LogBatch {
            claim: self.claim.clone(),
            lines,
        };
        self.retry
            .run("send_logs", || self.peer.send_logs(job_id, &batch))
            .await
    }

    async fn upload_artifact(
        &self,
        job_id: Uuid,
        artifact: ArtifactUpload,
    ) -> Result<(), PeerError> {
        self.retry
            .run("upload_artifact", || {
                self.peer.upload_artifact(job_id, &self.claim, &artifact)
            })
            .await
    }
}

#[cfg(test)]
pub use memory::MemorySink;
