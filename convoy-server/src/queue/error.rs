use convoy_core::domain::pipeline::PipelineError;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

/// Queue operation errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The caller does not hold the current lease of the job
    #[error("lease for job {0} is not held by the caller")]
    LeaseLost(Uuid),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(#[from] PipelineError),

    #[error("job {job} has no step named '{step}'")]
    UnknownStep { job: Uuid, step: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
