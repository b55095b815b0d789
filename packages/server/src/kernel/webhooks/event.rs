//! Webhook event and subscription models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "webhook_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    #[default]
    Received,
    Processing,
    Completed,
    Failed,
    Replayed,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub event_id: String,
    pub topic: String,
    pub status: WebhookStatus,
    pub raw_body: String,
    pub payload: Option<Value>,
    pub headers: Value,
    pub signature: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub processing_attempts: i32,
    pub queue_job_id: Option<i64>,
    pub replayed_from: Option<String>,
    pub replay_reason: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub struct NewWebhookEvent {
    pub event_id: String,
    pub topic: String,
    pub raw_body: String,
    pub payload: Option<Value>,
    pub headers: Value,
    pub signature: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

const EVENT_COLUMNS: &str = r#"
    id, event_id, topic, status, raw_body, payload, headers, signature,
    source_ip, user_agent, processing_attempts, queue_job_id,
    replayed_from, replay_reason, received_at, processed_at
"#;

impl WebhookEvent {
    /// Insert keyed by the provider event id. Returns `None` when the event
    /// was already persisted (idempotent redelivery).
    pub async fn insert(pool: &PgPool, new: NewWebhookEvent) -> anyhow::Result<Option<Self>> {
        let sql = format!(
            r#"
            INSERT INTO webhook_events
                (event_id, topic, raw_body, payload, headers, signature, source_ip, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let event = sqlx::query_as::<_, Self>(&sql)
            .bind(&new.event_id)
            .bind(&new.topic)
            .bind(&new.raw_body)
            .bind(&new.payload)
            .bind(&new.headers)
            .bind(&new.signature)
            .bind(&new.source_ip)
            .bind(&new.user_agent)
            .fetch_optional(pool)
            .await?;
        Ok(event)
    }

    pub async fn find_by_event_id(pool: &PgPool, event_id: &str) -> anyhow::Result<Option<Self>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_id = $1");
        let event = sqlx::query_as::<_, Self>(&sql)
            .bind(event_id)
            .fetch_optional(pool)
            .await?;
        Ok(event)
    }

    pub async fn mark_processing(pool: &PgPool, event_id: &str, job_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processing', queue_job_id = $1,
                processing_attempts = processing_attempts + 1
            WHERE event_id = $2
            "#,
        )
        .bind(job_id)
        .bind(event_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// `processed_at` is stamped once; repeated completions keep the original.
    pub async fn mark_completed(pool: &PgPool, event_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'completed',
                processed_at = COALESCE(processed_at, NOW())
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &PgPool, event_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE webhook_events SET status = 'failed' WHERE event_id = $1")
            .bind(event_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Flag a set of events for replay. Idempotent: already-replayed events
    /// keep their original stamp.
    pub async fn mark_replayed(
        pool: &PgPool,
        event_ids: &[String],
        reason: &str,
    ) -> anyhow::Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'replayed',
                replayed_from = COALESCE(replayed_from, event_id),
                replay_reason = $1
            WHERE event_id = ANY($2) AND status <> 'replayed'
            "#,
        )
        .bind(reason)
        .bind(event_ids)
        .execute(pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Ages (seconds) of the newest received and newest processed events,
    /// for the watchdog.
    pub async fn intake_ages(pool: &PgPool) -> anyhow::Result<(Option<i64>, Option<i64>)> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
            "SELECT MAX(received_at), MAX(processed_at) FROM webhook_events",
        )
        .fetch_one(pool)
        .await?;
        let now = Utc::now();
        let age = |t: Option<DateTime<Utc>>| t.map(|t| (now - t).num_seconds());
        Ok((age(row.0), age(row.1)))
    }
}

/// Bump per-topic counters. Pure bookkeeping: failures are warned and
/// swallowed.
pub async fn bump_subscription(pool: &PgPool, topic: &str) {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_subscriptions (topic, received_today, received_total, last_received_at)
        VALUES ($1, 1, 1, NOW())
        ON CONFLICT (topic) DO UPDATE SET
            received_today = CASE
                WHEN webhook_subscriptions.last_received_at::date = CURRENT_DATE
                THEN webhook_subscriptions.received_today + 1
                ELSE 1
            END,
            received_total = webhook_subscriptions.received_total + 1,
            last_received_at = NOW()
        "#,
    )
    .bind(topic)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!(topic, error = %e, "webhook subscription counter update failed");
    }
}
