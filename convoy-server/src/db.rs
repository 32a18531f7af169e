use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            build_id UUID NOT NULL,
            status VARCHAR(50) NOT NULL,
            pipeline JSONB NOT NULL,
            labels JSONB NOT NULL DEFAULT '{}',
            environment JSONB NOT NULL DEFAULT '{}',
            secrets JSONB NOT NULL DEFAULT '[]',
            timeout_secs BIGINT NOT NULL,
            inactivity_secs BIGINT NOT NULL,
            deliveries INTEGER NOT NULL DEFAULT 0,
            agent_id VARCHAR(255),
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            state JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            step VARCHAR(255) NOT NULL,
            number BIGINT NOT NULL,
            offset_secs BIGINT NOT NULL,
            message TEXT NOT NULL,
            PRIMARY KEY (job_id, step, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_artifacts (
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            step VARCHAR(255) NOT NULL,
            name VARCHAR(255) NOT NULL,
            mime VARCHAR(255) NOT NULL,
            size BIGINT NOT NULL,
            data BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (job_id, step)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_build_id ON jobs(build_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
