//! Core domain types
//!
//! This module contains the work item model shared between the server
//! (which queues and persists it) and the agent (which executes it).

pub mod artifact;
pub mod job;
pub mod lease;
pub mod log;
pub mod pipeline;
pub mod state;
