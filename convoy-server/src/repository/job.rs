//! Job Repository
//!
//! Handles all database operations related to jobs.

use convoy_core::domain::job::{Job, JobStatus};
use convoy_core::domain::state::ExecutionState;
use sqlx::PgPool;
use uuid::Uuid;

use crate::storage::StorageError;

/// Insert a job or overwrite the stored copy
pub async fn upsert(pool: &PgPool, job: &Job) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, build_id, status, pipeline, labels, environment, secrets,
                          timeout_secs, inactivity_secs, deliveries, agent_id,
                          cancel_requested, state, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            pipeline = EXCLUDED.pipeline,
            labels = EXCLUDED.labels,
            environment = EXCLUDED.environment,
            secrets = EXCLUDED.secrets,
            timeout_secs = EXCLUDED.timeout_secs,
            inactivity_secs = EXCLUDED.inactivity_secs,
            deliveries = EXCLUDED.deliveries,
            agent_id = EXCLUDED.agent_id,
            cancel_requested = EXCLUDED.cancel_requested,
            state = EXCLUDED.state,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(job.id)
    .bind(job.build_id)
    .bind(job.status.as_str())
    .bind(serde_json::to_value(&job.pipeline)?)
    .bind(serde_json::to_value(&job.labels)?)
    .bind(serde_json::to_value(&job.environment)?)
    .bind(serde_json::to_value(&job.secrets)?)
    .bind(job.timeout_secs as i64)
    .bind(job.inactivity_secs as i64)
    .bind(job.deliveries as i32)
    .bind(&job.agent_id)
    .bind(job.cancel_requested)
    .bind(job.state.as_ref().map(serde_json::to_value).transpose()?)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the latest execution state of a job
pub async fn update_state(
    pool: &PgPool,
    job_id: Uuid,
    state: &ExecutionState,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET state = $1, updated_at = $2
        WHERE id = $3
        "#,
    )
    .bind(serde_json::to_value(state)?)
    .bind(chrono::Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a job by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Job>, StorageError> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, build_id, status, pipeline, labels, environment, secrets,
               timeout_secs, inactivity_secs, deliveries, agent_id,
               cancel_requested, state, created_at, updated_at
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Job::try_from).transpose()
}

/// Find all jobs that have not reached a terminal status, oldest first
pub async fn find_incomplete(pool: &PgPool) -> Result<Vec<Job>, StorageError> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, build_id, status, pipeline, labels, environment, secrets,
               timeout_secs, inactivity_secs, deliveries, agent_id,
               cancel_requested, state, created_at, updated_at
        FROM jobs
        WHERE status IN ('Pending', 'Assigned', 'Running')
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Job::try_from).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    build_id: Uuid,
    status: String,
    pipeline: serde_json::Value,
    labels: serde_json::Value,
    environment: serde_json::Value,
    secrets: serde_json::Value,
    timeout_secs: i64,
    inactivity_secs: i64,
    deliveries: i32,
    agent_id: Option<String>,
    cancel_requested: bool,
    state: Option<serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().unwrap_or(JobStatus::Pending);

        Ok(Job {
            id: row.id,
            build_id: row.build_id,
            status,
            pipeline: serde_json::from_value(row.pipeline)?,
            labels: serde_json::from_value(row.labels)?,
            environment: serde_json::from_value(row.environment)?,
            secrets: serde_json::from_value(row.secrets)?,
            timeout_secs: row.timeout_secs.max(0) as u64,
            inactivity_secs: row.inactivity_secs.max(0) as u64,
            deliveries: row.deliveries.max(0) as u32,
            agent_id: row.agent_id,
            cancel_requested: row.cancel_requested,
            state: row.state.map(serde_json::from_value).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
