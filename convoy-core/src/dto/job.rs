//! Job DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::job::{Job, Secret};
use crate::domain::lease::Lease;
use crate::domain::pipeline::Pipeline;

/// Request to enqueue a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    /// Explicit job id; enqueueing the same id twice never duplicates it
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub build_id: Option<Uuid>,
    pub pipeline: Pipeline,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub inactivity_secs: Option<u64>,
}

/// A job handed to an agent together with the lease that owns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub job: Job,
    pub lease: Lease,
}

impl CreateJob {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            id: None,
            build_id: None,
            pipeline,
            labels: HashMap::new(),
            environment: HashMap::new(),
            secrets: Vec::new(),
            timeout_secs: None,
            inactivity_secs: None,
        }
    }

    /// Builds the pending job this request describes
    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.build_id.unwrap_or_else(Uuid::new_v4), self.pipeline);
        if let Some(id) = self.id {
            job.id = id;
        }
        job.labels = self.labels;
        job.environment = self.environment;
        job.secrets = self.secrets;
        if let Some(timeout) = self.timeout_secs {
            job.timeout_secs = timeout;
        }
        if let Some(inactivity) = self.inactivity_secs {
            job.inactivity_secs = inactivity;
        }
        job
    }
}
