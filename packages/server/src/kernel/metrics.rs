//! Metrics sink over minute-aligned counter buckets.
//!
//! The `metric_buckets` table backs both request metrics and per-IP rate
//! limiting: a row is `(key, window_start, count)` with the window aligned
//! to the minute. Bookkeeping must never fail the enclosing operation, so
//! the sink swallows errors with a warning.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

/// Latency histogram thresholds in milliseconds. Observations above the last
/// threshold land in the `le_inf` bucket.
pub const LATENCY_BUCKETS_MS: [i64; 8] = [50, 100, 200, 400, 800, 1600, 3200, 10000];

#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Increment a counter in the current minute window.
    async fn incr(&self, key: &str, by: i64);

    /// Record a latency observation: sum, count and the first bucket that
    /// contains it.
    async fn observe_ms(&self, key: &str, ms: i64) {
        self.incr(&format!("{}.sum", key), ms).await;
        self.incr(&format!("{}.count", key), 1).await;
        self.incr(&format!("{}.{}", key, bucket_label(ms)), 1).await;
    }
}

pub fn bucket_label(ms: i64) -> String {
    for threshold in LATENCY_BUCKETS_MS {
        if ms <= threshold {
            return format!("le_{}", threshold);
        }
    }
    "le_inf".to_string()
}

pub fn minute_window(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::minutes(1)).unwrap_or(now)
}

/// Postgres-backed sink shared by all worker processes.
pub struct PgMetricsSink {
    pool: PgPool,
}

impl PgMetricsSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Increment and return the new count for the current window. Used by the
    /// rate limiter, which needs the running total back.
    pub async fn incr_and_get(&self, key: &str, by: i64) -> anyhow::Result<i64> {
        let window = minute_window(Utc::now());
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO metric_buckets (key, window_start, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, window_start)
            DO UPDATE SET count = metric_buckets.count + EXCLUDED.count
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Counter totals over the trailing window, for the admin metrics route.
    pub async fn snapshot(&self, minutes: i64) -> anyhow::Result<Vec<MetricRow>> {
        let since = Utc::now() - Duration::minutes(minutes);
        let rows = sqlx::query_as::<_, MetricRow>(
            r#"
            SELECT key, SUM(count)::BIGINT AS count
            FROM metric_buckets
            WHERE window_start >= $1
            GROUP BY key
            ORDER BY key
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MetricRow {
    pub key: String,
    pub count: i64,
}

#[async_trait]
impl MetricsSink for PgMetricsSink {
    async fn incr(&self, key: &str, by: i64) {
        if let Err(e) = self.incr_and_get(key, by).await {
            warn!(key = %key, error = %e, "metric increment failed");
        }
    }
}

/// In-memory sink for tests: counters collapse across windows.
#[derive(Default)]
pub struct MemoryMetricsSink {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> i64 {
        *self.counters.lock().unwrap().get(key).unwrap_or(&0)
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn incr(&self, key: &str, by: i64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert(0) += by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_label_picks_first_containing_threshold() {
        assert_eq!(bucket_label(0), "le_50");
        assert_eq!(bucket_label(50), "le_50");
        assert_eq!(bucket_label(51), "le_100");
        assert_eq!(bucket_label(9999), "le_10000");
        assert_eq!(bucket_label(10001), "le_inf");
    }

    #[test]
    fn minute_window_truncates_seconds() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T10:15:42Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(minute_window(t).to_rfc3339(), "2026-03-01T10:15:00+00:00");
    }

    #[tokio::test]
    async fn memory_sink_accumulates_and_observes() {
        let sink = MemoryMetricsSink::new();
        sink.incr("requests", 2).await;
        sink.incr("requests", 1).await;
        sink.observe_ms("latency", 120).await;

        assert_eq!(sink.get("requests"), 3);
        assert_eq!(sink.get("latency.sum"), 120);
        assert_eq!(sink.get("latency.count"), 1);
        assert_eq!(sink.get("latency.le_200"), 1);
    }
}
