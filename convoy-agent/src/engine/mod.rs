//! Container engines
//!
//! The executor drives containers through [`ContainerEngine`]; the engine
//! owns everything runtime-specific (naming, mounts, kill, cleanup).

mod podman;
#[cfg(test)]
pub mod scripted;

pub use podman::{PodmanEngine, check_available};

use async_trait::async_trait;
use convoy_core::domain::job::Job;
use convoy_core::domain::pipeline::Step;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a step's container ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepExit {
    pub code: i32,
    pub oom_killed: bool,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("invalid artifact path '{0}'")]
    ArtifactPath(String),
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Prepares the per-job workspace
    async fn setup(&self, job: &Job) -> Result<(), EngineError>;

    /// Runs one step to completion, streaming output lines into `output`
    ///
    /// When `kill` fires the container is force-terminated and the call
    /// returns promptly.
    async fn run_step(
        &self,
        job: &Job,
        step: &Step,
        env: &HashMap<String, String>,
        output: mpsc::Sender<String>,
        kill: CancellationToken,
    ) -> Result<StepExit, EngineError>;

    /// Reads a file produced in the job workspace
    async fn read_artifact(&self, job: &Job, path: &str) -> Result<Vec<u8>, EngineError>;

    /// Removes everything `setup` and `run_step` created
    async fn teardown(&self, job: &Job) -> Result<(), EngineError>;
}
