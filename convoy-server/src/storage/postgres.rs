//! PostgreSQL storage

use async_trait::async_trait;
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::Job;
use convoy_core::domain::log::LogLine;
use convoy_core::domain::state::ExecutionState;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Storage, StorageError};
use crate::repository::{artifact_repository, job_repository, log_repository};

/// Storage backed by a Postgres pool
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn persist_job(&self, job: &Job) -> Result<(), StorageError> {
        job_repository::upsert(&self.pool, job).await
    }

    async fn persist_execution_state(
        &self,
        job_id: Uuid,
        state: &ExecutionState,
    ) -> Result<(), StorageError> {
        job_repository::update_state(&self.pool, job_id, state).await
    }

    async fn persist_log_lines(
        &self,
        job_id: Uuid,
        lines: &[LogLine],
    ) -> Result<(), StorageError> {
        Ok(log_repository::add_lines(&self.pool, job_id, lines).await?)
    }

    async fn persist_artifact(&self, artifact: &Artifact, data: &[u8]) -> Result<(), StorageError> {
        Ok(artifact_repository::create(&self.pool, artifact, data).await?)
    }

    async fn discard_output(&self, job_id: Uuid) -> Result<(), StorageError> {
        let lines = log_repository::delete_by_job(&self.pool, job_id).await?;
        let artifacts = artifact_repository::delete_by_job(&self.pool, job_id).await?;
        tracing::debug!(job_id = %job_id, lines, artifacts, "Discarded previous run output");
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        job_repository::find_by_id(&self.pool, id).await
    }

    async fn logs(&self, job_id: Uuid) -> Result<Vec<LogLine>, StorageError> {
        Ok(log_repository::find_by_job(&self.pool, job_id).await?)
    }

    async fn artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>, StorageError> {
        Ok(artifact_repository::find_by_job(&self.pool, job_id).await?)
    }

    async fn artifact_data(
        &self,
        job_id: Uuid,
        step: &str,
    ) -> Result<Option<(Artifact, Vec<u8>)>, StorageError> {
        Ok(artifact_repository::find_with_data(&self.pool, job_id, step).await?)
    }

    async fn incomplete_jobs(&self) -> Result<Vec<Job>, StorageError> {
        job_repository::find_incomplete(&self.pool).await
    }
}
