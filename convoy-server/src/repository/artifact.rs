//! Artifact Repository

use convoy_core::domain::artifact::Artifact;
use sqlx::PgPool;
use uuid::Uuid;

/// Store an artifact unless the step already has one
pub async fn create(pool: &PgPool, artifact: &Artifact, data: &[u8]) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_artifacts (job_id, step, name, mime, size, data, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (job_id, step) DO NOTHING
        "#,
    )
    .bind(artifact.job_id)
    .bind(&artifact.step)
    .bind(&artifact.name)
    .bind(&artifact.mime)
    .bind(artifact.size as i64)
    .bind(data)
    .bind(artifact.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// List artifact metadata for a job
pub async fn find_by_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Artifact>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ArtifactRow>(
        r#"
        SELECT job_id, step, name, mime, size, created_at
        FROM job_artifacts
        WHERE job_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Fetch one artifact with its payload
pub async fn find_with_data(
    pool: &PgPool,
    job_id: Uuid,
    step: &str,
) -> Result<Option<(Artifact, Vec<u8>)>, sqlx::Error> {
    let row = sqlx::query_as::<_, ArtifactDataRow>(
        r#"
        SELECT job_id, step, name, mime, size, created_at, data
        FROM job_artifacts
        WHERE job_id = $1 AND step = $2
        "#,
    )
    .bind(job_id)
    .bind(step)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| {
        let data = r.data;
        (r.meta.into(), data)
    }))
}

/// Remove every artifact of a job
pub async fn delete_by_job(pool: &PgPool, job_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM job_artifacts WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    job_id: Uuid,
    step: String,
    name: String,
    mime: String,
    size: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow)]
struct ArtifactDataRow {
    #[sqlx(flatten)]
    meta: ArtifactRow,
    data: Vec<u8>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            job_id: row.job_id,
            step: row.step,
            name: row.name,
            mime: row.mime,
            size: row.size.max(0) as u64,
            created_at: row.created_at,
        }
    }
}
