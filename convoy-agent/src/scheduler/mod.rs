//! Scheduler layer for the agent
//!
//! The poller runs one loop per slot; each loop pulls a job, hands it to the
//! job runner and waits for it to be reported before pulling again.

pub mod job;
pub mod poller;

pub use job::JobRunner;
pub use poller::{AgentError, JobPoller};
