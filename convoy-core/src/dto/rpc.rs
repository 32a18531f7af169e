//! Agent RPC DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::job::JobStatus;
use crate::domain::lease::LeaseClaim;
use crate::domain::log::LogLine;
use crate::domain::state::ExecutionState;

/// Longest time a server may hold a `next` or `wait` call open
pub const MAX_POLL_WINDOW: Duration = Duration::from_secs(60);

/// Largest artifact an agent uploads; servers accept bodies at least this big
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Headers carrying the lease claim of an artifact upload
pub const AGENT_ID_HEADER: &str = "x-convoy-agent-id";
pub const LEASE_TOKEN_HEADER: &str = "x-convoy-lease-token";

/// Body of `next`: who is asking and what it can run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextRequest {
    pub agent_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Body of `update` and `complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub claim: LeaseClaim,
    pub state: ExecutionState,
}

/// Response of `complete`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub status: JobStatus,
}

/// Why a `wait` call returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitOutcome {
    /// The job was cancelled
    Cancelled,
    /// The job reached a terminal state
    Finished,
    /// The lease was reclaimed and the job handed back to the queue
    Revoked,
    /// Nothing happened before the poll window closed
    Pending,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaitResponse {
    pub outcome: WaitOutcome,
}

/// Body of `logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub claim: LeaseClaim,
    pub lines: Vec<LogLine>,
}

/// Query string of the artifact upload route; the claim travels in headers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactQuery {
    pub name: String,
}

/// Queue occupancy counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
}
