//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::pipeline::Pipeline;
use crate::domain::state::ExecutionState;

/// Default wall-clock limit for a job
pub const DEFAULT_TIMEOUT_SECS: u64 = 60 * 60;

/// Default limit on time without log output while a step runs
pub const DEFAULT_INACTIVITY_SECS: u64 = 10 * 60;

/// A schedulable unit of work
///
/// Structure shared between server (queues and persists) and agent (executes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub build_id: Uuid,
    pub status: JobStatus,
    pub pipeline: Pipeline,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    pub timeout_secs: u64,
    pub inactivity_secs: u64,
    /// How many times the job has been handed to an agent
    pub deliveries: u32,
    pub agent_id: Option<String>,
    pub cancel_requested: bool,
    pub state: Option<ExecutionState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Success,
    Failure,
    Error,
    /// Aborted by its wall-clock timeout
    Killed,
    Cancelled,
}

/// A secret value injected into the job environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
    /// Replace occurrences of the value in log output
    #[serde(default = "default_mask")]
    pub masked: bool,
}

fn default_mask() -> bool {
    true
}

impl Job {
    /// Creates a pending job for `pipeline` with default limits
    pub fn new(build_id: Uuid, pipeline: Pipeline) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            build_id,
            status: JobStatus::Pending,
            pipeline,
            labels: HashMap::new(),
            environment: HashMap::new(),
            secrets: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            inactivity_secs: DEFAULT_INACTIVITY_SECS,
            deliveries: 0,
            agent_id: None,
            cancel_requested: false,
            state: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    /// Returns true if every label of the job is present with the same
    /// value in `agent_labels`
    pub fn matches_labels(&self, agent_labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| agent_labels.get(k).is_some_and(|a| a == v))
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success
                | JobStatus::Failure
                | JobStatus::Error
                | JobStatus::Killed
                | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Assigned => "Assigned",
            JobStatus::Running => "Running",
            JobStatus::Success => "Success",
            JobStatus::Failure => "Failure",
            JobStatus::Error => "Error",
            JobStatus::Killed => "Killed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(JobStatus::Pending),
            "Assigned" => Ok(JobStatus::Assigned),
            "Running" => Ok(JobStatus::Running),
            "Success" => Ok(JobStatus::Success),
            "Failure" => Ok(JobStatus::Failure),
            "Error" => Ok(JobStatus::Error),
            "Killed" => Ok(JobStatus::Killed),
            "Cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::Step;

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            Pipeline::new("p", vec![Step::new("a", "alpine", vec![])]),
        )
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Assigned.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Killed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_string_conversion() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Failure,
            JobStatus::Killed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("Bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_label_matching() {
        let job = job().with_label("platform", "linux/amd64");

        let mut agent = HashMap::new();
        assert!(!job.matches_labels(&agent));

        agent.insert("platform".to_string(), "linux/arm64".to_string());
        assert!(!job.matches_labels(&agent));

        agent.insert("platform".to_string(), "linux/amd64".to_string());
        agent.insert("gpu".to_string(), "true".to_string());
        assert!(job.matches_labels(&agent));
    }

    #[test]
    fn test_unlabelled_job_matches_any_agent() {
        assert!(job().matches_labels(&HashMap::new()));
    }
}
