//! Completion notifiers
//!
//! Invoked once per job when it reaches a terminal status. A failed
//! notification is logged by the caller and never affects the job.

use chrono::{DateTime, Utc};
use convoy_core::domain::job::{Job, JobStatus};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Payload describing a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub build_id: Uuid,
    pub pipeline: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

/// Notification target selected by configuration
#[derive(Debug, Clone)]
pub enum Notifier {
    /// Emit a tracing event
    Log,
    /// POST the event as JSON
    Webhook {
        url: String,
        client: reqwest::Client,
    },
}

impl JobEvent {
    pub fn from_job(job: &Job) -> Self {
        let state = job.state.as_ref();
        Self {
            job_id: job.id,
            build_id: job.build_id,
            pipeline: job.pipeline.name.clone(),
            status: job.status,
            exit_code: state.filter(|s| s.exited).map(|s| s.exit_code),
            error: state.and_then(|s| s.error.clone()),
            finished_at: job.updated_at,
        }
    }
}

impl Notifier {
    /// Picks the webhook notifier when a URL is configured
    pub fn from_url(url: Option<String>) -> Self {
        match url {
            Some(url) => Notifier::Webhook {
                url,
                client: reqwest::Client::new(),
            },
            None => Notifier::Log,
        }
    }

    pub async fn send(&self, event: &JobEvent) -> Result<(), NotifyError> {
        match self {
            Notifier::Log => {
                tracing::info!(
                    job_id = %event.job_id,
                    build_id = %event.build_id,
                    status = %event.status,
                    exit_code = ?event.exit_code,
                    "Job finished"
                );
                Ok(())
            }
            Notifier::Webhook { url, client } => {
                let response = client.post(url).json(event).send().await?;
                if !response.status().is_success() {
                    return Err(NotifyError::Status(response.status().as_u16()));
                }
                tracing::debug!(job_id = %event.job_id, "Webhook delivered to {}", url);
                Ok(())
            }
        }
    }
}
