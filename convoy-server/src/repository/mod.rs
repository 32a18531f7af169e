//! Repository Module
//!
//! Data access layer backing [`crate::storage::PgStorage`].
//! Each repository handles database operations for a specific entity.

pub mod artifact;
pub mod job;
pub mod log;

pub use artifact as artifact_repository;
pub use job as job_repository;
pub use log as log_repository;
