//! Work-item repository: the atomic enqueue/claim/heartbeat/complete/fail
//! state machine over the `jobs` table.
//!
//! Concurrency contract: no two workers ever receive the same job. Claims go
//! through a single CTE with `FOR UPDATE SKIP LOCKED`, so rows locked by a
//! concurrent claimer are skipped rather than waited on. Jobs whose lease
//! expired without a heartbeat become claimable again on the same path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use super::dlq::{classify_failure, DeadLetterJob};
use super::job::{
    clamp_priority, Job, JobStatus, JobType, QueueGauge, DEFAULT_MAX_ATTEMPTS, JOB_COLUMNS,
    LEASE_SECONDS,
};
use super::log::{JobLog, LogLevel};
use crate::kernel::locks;
use crate::kernel::settings::{keys, SettingsStore};

/// Upper bound on a single claim.
pub const MAX_CLAIM_BATCH: i64 = 200;

/// Transaction attempts per mutating operation before a deadlock is surfaced.
const TX_ATTEMPTS: u32 = 3;

/// How long enqueue waits on the per-key advisory lock.
const ENQUEUE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new row was inserted.
    Created(i64),
    /// A job with the same idempotency key already existed.
    Duplicate(i64),
}

impl EnqueueResult {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Retry scheduled; the job went back to pending.
    Retried { attempts: i32, next_run_at: DateTime<Utc> },
    /// Retry budget exhausted; the job was mirrored into the dead-letter table.
    DeadLettered { attempts: i32 },
}

pub struct JobRepo {
    pool: PgPool,
    settings: Arc<SettingsStore>,
}

impl JobRepo {
    pub fn new(pool: PgPool, settings: Arc<SettingsStore>) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Insert a job, deduplicating on the idempotency key. Concurrent
    /// enqueues with the same key serialize on an advisory lock derived from
    /// the key; the unique index is the backstop if the lock cannot be taken.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
        priority: Option<i16>,
    ) -> Result<EnqueueResult> {
        if let Some(key) = idempotency_key {
            if key.is_empty() || key.len() > 128 {
                bail!("idempotency key must be 1..=128 characters");
            }
            let lock_name = format!("enqueue:{}", key);
            let outcome = locks::with_lock(&self.pool, &lock_name, ENQUEUE_LOCK_TIMEOUT, || {
                self.enqueue_with_retry(job_type, &payload, Some(key), priority)
            })
            .await?;
            return Ok(outcome.value);
        }
        self.enqueue_with_retry(job_type, &payload, None, priority)
            .await
    }

    async fn enqueue_with_retry(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        idempotency_key: Option<&str>,
        priority: Option<i16>,
    ) -> Result<EnqueueResult> {
        retry_on_deadlock("enqueue", || {
            self.enqueue_once(job_type, payload, idempotency_key, priority)
        })
        .await
    }

    async fn enqueue_once(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        idempotency_key: Option<&str>,
        priority: Option<i16>,
    ) -> Result<EnqueueResult> {
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let max_attempts = self
            .settings
            .get_i64(keys::QUEUE_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS as i64)
            .await?
            .max(1) as i32;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, priority, payload, idempotency_key, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job_type.as_str())
        .bind(clamp_priority(priority))
        .bind(payload)
        .bind(idempotency_key)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .context("insert job")?;

        match inserted {
            Some(id) => {
                let correlation = payload.get("trace_id").and_then(|v| v.as_str());
                JobLog::append(&self.pool, id, LogLevel::Info, "job.created", correlation).await;
                debug!(job_id = id, job_type = %job_type, "job enqueued");
                Ok(EnqueueResult::Created(id))
            }
            None => {
                // Lost the insert race on the unique index; the winner's row
                // is the result.
                let key = idempotency_key.expect("conflict only possible with a key");
                let existing = self
                    .find_by_idempotency_key(key)
                    .await?
                    .context("job vanished after idempotency conflict")?;
                Ok(EnqueueResult::Duplicate(existing))
            }
        }
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM jobs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Claim / lease
    // ------------------------------------------------------------------

    /// Claim up to `limit` runnable jobs, optionally restricted to one type.
    /// Ordering: priority, then age (updated_at), then id. Expired leases on
    /// `working` rows are reclaimed here as well.
    pub async fn claim_batch(&self, limit: i64, job_type: Option<JobType>) -> Result<Vec<Job>> {
        let limit = limit.clamp(1, MAX_CLAIM_BATCH);
        let jobs = retry_on_deadlock("claim_batch", || self.claim_once(limit, job_type)).await?;

        for job in &jobs {
            JobLog::append(&self.pool, job.id, LogLevel::Info, "job.claimed", job.trace_id()).await;
        }
        Ok(jobs)
    }

    async fn claim_once(&self, limit: i64, job_type: Option<JobType>) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE (
                        (status = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                        OR (status = 'working' AND lease_until IS NOT NULL AND lease_until < NOW())
                      )
                  AND ($2::text IS NULL OR job_type = $2)
                ORDER BY priority ASC, updated_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'working',
                started_at = NOW(),
                lease_until = NOW() + ($3 || ' seconds')::INTERVAL,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(limit)
            .bind(job_type.map(|t| t.as_str()))
            .bind(LEASE_SECONDS.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    /// Extend the lease of a working job. Silent no-op for any other status.
    pub async fn heartbeat(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW(),
                lease_until = NOW() + ($1 || ' seconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'working'
            "#,
        )
        .bind(LEASE_SECONDS.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    /// `working -> done`. Completing an already-done job is a no-op.
    pub async fn complete(&self, id: i64) -> Result<()> {
        let affected = retry_on_deadlock("complete", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'done', finished_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'working'
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected > 0 {
            JobLog::append(&self.pool, id, LogLevel::Info, "job.completed", None).await;
        }
        Ok(())
    }

    /// Record a failure: schedule a retry with exponential backoff, or mirror
    /// the job into the dead-letter table once the budget is exhausted.
    pub async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome> {
        let outcome = retry_on_deadlock("fail", || self.fail_once(id, error)).await?;

        match &outcome {
            FailOutcome::Retried { attempts, next_run_at } => {
                JobLog::append(
                    &self.pool,
                    id,
                    LogLevel::Warning,
                    &format!("job.retry attempt={} next_run_at={}", attempts, next_run_at),
                    None,
                )
                .await;
            }
            FailOutcome::DeadLettered { attempts } => {
                JobLog::append(
                    &self.pool,
                    id,
                    LogLevel::Error,
                    &format!("job.failed.final attempts={}", attempts),
                    None,
                )
                .await;
                info!(job_id = id, error, "job moved to dead letter");
            }
        }
        Ok(outcome)
    }

    async fn fail_once(&self, id: i64, error: &str) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("job {} not found", id))?;

        let attempts = job.attempts + 1;

        if attempts >= job.max_attempts {
            sqlx::query(
                r#"
                INSERT INTO dead_letter_jobs
                    (job_id, job_type, payload, idempotency_key, failure_class,
                     failure_message, attempts, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (job_id) DO UPDATE
                SET failure_message = EXCLUDED.failure_message,
                    failure_class = EXCLUDED.failure_class,
                    attempts = EXCLUDED.attempts,
                    moved_at = NOW()
                "#,
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(&job.idempotency_key)
            .bind(classify_failure(error))
            .bind(error)
            .bind(attempts)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', attempts = $1, last_error = $2,
                    finished_at = NOW(), lease_until = NULL, updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(attempts)
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        let next_run_at = Utc::now() + retry_backoff(attempts);
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = $1, last_error = $2,
                next_run_at = $3, lease_until = NULL, heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(attempts)
        .bind(error)
        .bind(next_run_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FailOutcome::Retried { attempts, next_run_at })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn find(&self, id: i64) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    /// Pending/working counts per job type, for the dispatcher selection
    /// table and the admin status route.
    pub async fn gauges(&self) -> Result<HashMap<String, QueueGauge>> {
        let rows = sqlx::query_as::<_, (String, JobStatus, i64)>(
            r#"
            SELECT job_type, status, COUNT(*)
            FROM jobs
            WHERE status IN ('pending', 'working')
            GROUP BY job_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut gauges: HashMap<String, QueueGauge> = HashMap::new();
        for (job_type, status, count) in rows {
            let gauge = gauges.entry(job_type).or_default();
            match status {
                JobStatus::Pending => gauge.pending = count,
                JobStatus::Working => gauge.working = count,
                _ => {}
            }
        }
        Ok(gauges)
    }

    /// Count of jobs completed in the trailing window, for the watchdog.
    pub async fn completed_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE status = 'done' AND finished_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn last_started_at(&self) -> Result<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT MAX(started_at) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(at)
    }

    pub async fn last_finished_at(&self) -> Result<Option<DateTime<Utc>>> {
        let at =
            sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT MAX(finished_at) FROM jobs")
                .fetch_one(&self.pool)
                .await?;
        Ok(at)
    }

    // ------------------------------------------------------------------
    // Dead letter queue
    // ------------------------------------------------------------------

    pub async fn dlq_list(&self, limit: i64) -> Result<Vec<DeadLetterJob>> {
        let rows = sqlx::query_as::<_, DeadLetterJob>(
            r#"
            SELECT job_id, job_type, payload, idempotency_key, failure_class,
                   failure_message, attempts, created_at, moved_at
            FROM dead_letter_jobs
            ORDER BY moved_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn dlq_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letter_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Redrive explicit dead-letter ids back to pending. Attempts are
    /// decremented so a redriven job gets at least one fresh try.
    pub async fn redrive_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let moved = retry_on_deadlock("redrive", || self.redrive_once(ids)).await?;
        for id in ids {
            JobLog::append(&self.pool, *id, LogLevel::Info, "job.redriven", None).await;
        }
        Ok(moved)
    }

    /// Redrive the oldest `limit` dead-letter rows.
    pub async fn redrive_oldest(&self, limit: i64) -> Result<u64> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT job_id FROM dead_letter_jobs ORDER BY moved_at ASC LIMIT $1",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        self.redrive_ids(&ids).await
    }

    async fn redrive_once(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = GREATEST(0, attempts - 1),
                next_run_at = NOW() + INTERVAL '1 minute',
                finished_at = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE id = ANY($1) AND status = 'failed'
            "#,
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM dead_letter_jobs WHERE job_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved)
    }

    /// Expose `WithLock` at the repository boundary for callers that need
    /// named single-flight sections.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> Result<locks::LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        locks::with_lock(&self.pool, name, timeout, f).await
    }
}

/// Exponential retry backoff: `2^attempts` minutes plus up to 30 seconds of
/// uniform jitter.
pub fn retry_backoff(attempts: i32) -> chrono::Duration {
    let minutes = 2i64.saturating_pow(attempts.clamp(0, 20) as u32);
    let jitter_secs = fastrand::i64(0..=30);
    chrono::Duration::minutes(minutes) + chrono::Duration::seconds(jitter_secs)
}

/// Pause between deadlock-retried transaction attempts: linearly increasing
/// with jitter, capped at 1.2 seconds.
fn deadlock_pause(attempt: u32) -> Duration {
    let base_ms = 200u64 * attempt as u64;
    let jitter_ms = fastrand::u64(0..=200);
    Duration::from_millis((base_ms + jitter_ms).min(1200))
}

fn is_deadlock(error: &anyhow::Error) -> bool {
    let Some(sqlx::Error::Database(db)) = error.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
}

async fn retry_on_deadlock<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Err(e) if attempt < TX_ATTEMPTS && is_deadlock(&e) => {
                tracing::warn!(op, attempt, "deadlock detected, retrying transaction");
                tokio::time::sleep(deadlock_pause(attempt)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_doubles_with_bounded_jitter() {
        for attempts in 1..=3 {
            let base = 60 * 2i64.pow(attempts as u32);
            for _ in 0..50 {
                let d = retry_backoff(attempts).num_seconds();
                assert!(d >= base, "attempt {attempts}: {d} < {base}");
                assert!(d <= base + 30, "attempt {attempts}: {d} > {}", base + 30);
            }
        }
    }

    #[test]
    fn retry_backoff_saturates_on_large_attempts() {
        // Guard against overflow on pathological attempt counts.
        let d = retry_backoff(1000);
        assert!(d.num_seconds() > 0);
    }

    #[test]
    fn deadlock_pause_is_capped() {
        for attempt in 1..=10 {
            assert!(deadlock_pause(attempt) <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn enqueue_result_exposes_id() {
        assert_eq!(EnqueueResult::Created(7).job_id(), 7);
        assert_eq!(EnqueueResult::Duplicate(7).job_id(), 7);
        assert!(EnqueueResult::Created(1).is_created());
        assert!(!EnqueueResult::Duplicate(1).is_created());
    }
}
