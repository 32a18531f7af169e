//! Convoy Server
//!
//! Central half of the job-dispatch protocol:
//! - Queue: pending jobs, leases, cancellation fan-out
//! - Lease reaper: re-delivers jobs whose agent went silent
//! - Storage: durable record of jobs, logs and artifacts (memory or Postgres)
//! - Notifiers: completion hooks
//! - API: HTTP surface for agents and operators

pub mod api;
pub mod config;
pub mod db;
pub mod lease;
pub mod notify;
pub mod queue;
pub mod repository;
pub mod storage;
