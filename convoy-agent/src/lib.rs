//! Convoy Agent
//!
//! Worker half of the job-dispatch protocol. An agent long-polls the server
//! for jobs, runs their pipelines in containers and streams results back:
//! - Scheduler: slot loops, lease heartbeat, cancellation, timeouts
//! - Pipeline: step graph execution on a container engine
//! - Reporter: ordered, masked log delivery and artifact upload
//! - Peer: the dispatch protocol, with bounded retries

pub mod config;
pub mod engine;
pub mod peer;
pub mod pipeline;
pub mod reporter;
pub mod retry;
pub mod scheduler;
