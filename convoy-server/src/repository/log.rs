//! Log Repository
//!
//! Handles all database operations related to job log lines.

use convoy_core::domain::log::LogLine;
use sqlx::PgPool;
use uuid::Uuid;

/// Add log lines for a job, ignoring lines that were already stored
pub async fn add_lines(pool: &PgPool, job_id: Uuid, lines: &[LogLine]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for line in lines {
        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, step, number, offset_secs, message)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id, step, number) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&line.step)
        .bind(line.number as i64)
        .bind(line.offset_secs as i64)
        .bind(&line.message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Get all log lines for a job
pub async fn find_by_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<LogLine>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT step, number, offset_secs, message
        FROM job_logs
        WHERE job_id = $1
        ORDER BY step ASC, number ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Remove every log line of a job
pub async fn delete_by_job(pool: &PgPool, job_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM job_logs WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[derive(sqlx::FromRow)]
struct LogRow {
    step: String,
    number: i64,
    offset_secs: i64,
    message: String,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            step: row.step,
            number: row.number.max(0) as u64,
            offset_secs: row.offset_secs.max(0) as u64,
            message: row.message,
        }
    }
}
