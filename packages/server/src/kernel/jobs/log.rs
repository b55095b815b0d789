//! Append-only job audit log.
//!
//! Log rows are bookkeeping: failures to append are warned and swallowed so
//! they can never fail the queue operation that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "log_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobLog {
    /// Best-effort append.
    pub async fn append(
        pool: &PgPool,
        job_id: i64,
        level: LogLevel,
        message: &str,
        correlation_id: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, level, message, correlation_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(level)
        .bind(message)
        .bind(correlation_id)
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!(job_id, message, error = %e, "job log append failed");
        }
    }

    pub async fn for_job(pool: &PgPool, job_id: i64, limit: i64) -> anyhow::Result<Vec<JobLog>> {
        let logs = sqlx::query_as::<_, JobLog>(
            r#"
            SELECT id, job_id, level, message, correlation_id, created_at
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }
}
