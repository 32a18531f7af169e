//! Execution state reported by agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known exit codes
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// Internal executor error
    pub const ERROR: i32 = 1;
    /// A step exiting with this code passes and skips the remaining steps
    pub const SKIP: i32 = 78;
    /// Step killed by the inactivity watchdog
    pub const INACTIVE: i32 = 124;
    /// Timeout, cancellation, lease loss or out-of-memory
    pub const KILLED: i32 = 137;
}

/// Outcome of a job as reported by its agent
///
/// Produced incrementally ("started") and finally ("exited").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub exited: bool,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl ExecutionState {
    /// State reported when execution begins
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started: Some(at),
            ..Default::default()
        }
    }

    /// Final state with the given exit code and optional error
    pub fn exited(self, at: DateTime<Utc>, exit_code: i32, error: Option<String>) -> Self {
        Self {
            started: self.started.or(Some(at)),
            finished: Some(at),
            exited: true,
            exit_code,
            error,
        }
    }

    pub fn is_killed(&self) -> bool {
        self.exited && self.exit_code == exit_code::KILLED && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exited_keeps_start_time() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(5);
        let state = ExecutionState::started(start).exited(end, 0, None);

        assert_eq!(state.started, Some(start));
        assert_eq!(state.finished, Some(end));
        assert!(state.exited);
        assert!(!state.is_killed());
    }

    #[test]
    fn test_killed_requires_no_error() {
        let now = Utc::now();
        let killed = ExecutionState::default().exited(now, exit_code::KILLED, None);
        assert!(killed.is_killed());

        let oom = ExecutionState::default().exited(
            now,
            exit_code::KILLED,
            Some("exceeded memory limit".to_string()),
        );
        assert!(!oom.is_killed());
    }
}
