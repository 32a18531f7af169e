//! Convoy Core
//!
//! Core types and abstractions for the Convoy job-dispatch system.
//!
//! This crate contains:
//! - Domain types: jobs, pipelines, steps, leases, execution state, logs, artifacts
//! - DTOs: Data transfer objects for the server/agent wire protocol

pub mod domain;
pub mod dto;
