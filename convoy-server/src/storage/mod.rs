//! Storage collaborator
//!
//! The queue is authoritative for live job state; storage keeps the durable
//! record (jobs, execution states, log lines, artifacts). Every write is
//! idempotent so that callers may retry.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use async_trait::async_trait;
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::Job;
use convoy_core::domain::log::LogLine;
use convoy_core::domain::state::ExecutionState;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts or replaces the job record
    async fn persist_job(&self, job: &Job) -> Result<(), StorageError>;

    async fn persist_execution_state(
        &self,
        job_id: Uuid,
        state: &ExecutionState,
    ) -> Result<(), StorageError>;

    /// Appends log lines; lines already stored (same step and number) are kept
    async fn persist_log_lines(&self, job_id: Uuid, lines: &[LogLine])
    -> Result<(), StorageError>;

    /// Stores an artifact; the first upload for a step wins
    async fn persist_artifact(&self, artifact: &Artifact, data: &[u8])
    -> Result<(), StorageError>;

    /// Drops the log lines and artifacts of a job, used before it is
    /// delivered again so a new run starts from an empty record
    async fn discard_output(&self, job_id: Uuid) -> Result<(), StorageError>;

    /// Stored copy of a job
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    /// Log lines of a job ordered by step then number
    async fn logs(&self, job_id: Uuid) -> Result<Vec<LogLine>, StorageError>;

    async fn artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>, StorageError>;

    async fn artifact_data(
        &self,
        job_id: Uuid,
        step: &str,
    ) -> Result<Option<(Artifact, Vec<u8>)>, StorageError>;

    /// Jobs that had not reached a terminal state, used to refill the queue
    /// on startup
    async fn incomplete_jobs(&self) -> Result<Vec<Job>, StorageError>;
}
