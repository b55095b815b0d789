//! Job row model for the durable work-item queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Default retry budget when the settings store carries no override.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lease granted to a claimed job; heartbeats extend it by the same amount.
pub const LEASE_SECONDS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Working,
    Done,
    Failed,
}

/// The closed set of work-item types. The dispatcher's selection table and
/// the handler registry key on this enum; the row itself stores the wire
/// string so unknown rows surface as typed failures instead of panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    CreateConsignment,
    UpdateConsignment,
    CancelConsignment,
    EditConsignmentLines,
    AddConsignmentProducts,
    MarkTransferPartial,
    PushProductUpdate,
    InventoryCommand,
    WebhookEvent,
    SyncProduct,
    SyncInventory,
    SyncCustomer,
    SyncSale,
    PullProducts,
    PullInventory,
    PullConsignments,
}

impl JobType {
    pub const ALL: [JobType; 16] = [
        JobType::CreateConsignment,
        JobType::UpdateConsignment,
        JobType::CancelConsignment,
        JobType::EditConsignmentLines,
        JobType::AddConsignmentProducts,
        JobType::MarkTransferPartial,
        JobType::PushProductUpdate,
        JobType::InventoryCommand,
        JobType::WebhookEvent,
        JobType::SyncProduct,
        JobType::SyncInventory,
        JobType::SyncCustomer,
        JobType::SyncSale,
        JobType::PullProducts,
        JobType::PullInventory,
        JobType::PullConsignments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreateConsignment => "create_consignment",
            JobType::UpdateConsignment => "update_consignment",
            JobType::CancelConsignment => "cancel_consignment",
            JobType::EditConsignmentLines => "edit_consignment_lines",
            JobType::AddConsignmentProducts => "add_consignment_products",
            JobType::MarkTransferPartial => "mark_transfer_partial",
            JobType::PushProductUpdate => "push_product_update",
            JobType::InventoryCommand => "inventory.command",
            JobType::WebhookEvent => "webhook.event",
            JobType::SyncProduct => "sync_product",
            JobType::SyncInventory => "sync_inventory",
            JobType::SyncCustomer => "sync_customer",
            JobType::SyncSale => "sync_sale",
            JobType::PullProducts => "pull_products",
            JobType::PullInventory => "pull_inventory",
            JobType::PullConsignments => "pull_consignments",
        }
    }

    pub fn parse(raw: &str) -> Option<JobType> {
        JobType::ALL.iter().copied().find(|t| t.as_str() == raw)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::parse(s).ok_or_else(|| anyhow::anyhow!("unknown job type: {}", s))
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    pub priority: i16,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn typed(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }

    /// Correlation id for audit rows, taken from the payload when the
    /// producer supplied one.
    pub fn trace_id(&self) -> Option<&str> {
        self.payload.get("trace_id").and_then(|v| v.as_str())
    }
}

/// Clamp a requested priority into the valid [1..9] band (1 is highest).
pub fn clamp_priority(requested: Option<i16>) -> i16 {
    requested.unwrap_or(5).clamp(1, 9)
}

/// Per-type queue gauges used by the dispatcher's selection table and the
/// admin status route.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueGauge {
    pub pending: i64,
    pub working: i64,
}

pub(crate) const JOB_COLUMNS: &str = r#"
    id, job_type, priority, payload, idempotency_key, attempts, max_attempts,
    status, last_error, next_run_at, lease_until, heartbeat_at,
    started_at, finished_at, created_at, updated_at
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_clamps_into_band() {
        assert_eq!(clamp_priority(None), 5);
        assert_eq!(clamp_priority(Some(0)), 1);
        assert_eq!(clamp_priority(Some(1)), 1);
        assert_eq!(clamp_priority(Some(9)), 9);
        assert_eq!(clamp_priority(Some(42)), 9);
        assert_eq!(clamp_priority(Some(-3)), 1);
    }

    #[test]
    fn job_type_round_trips_through_wire_strings() {
        for t in JobType::ALL {
            assert_eq!(JobType::parse(t.as_str()), Some(t));
        }
        assert_eq!(JobType::parse("inventory.command"), Some(JobType::InventoryCommand));
        assert!(JobType::parse("made_up").is_none());
    }

    #[test]
    fn trace_id_read_from_payload() {
        let mut job = Job {
            id: 1,
            job_type: "sync_product".into(),
            priority: 5,
            payload: serde_json::json!({"trace_id": "t-123"}),
            idempotency_key: None,
            attempts: 0,
            max_attempts: 3,
            status: JobStatus::Pending,
            last_error: None,
            next_run_at: None,
            lease_until: None,
            heartbeat_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(job.trace_id(), Some("t-123"));
        job.payload = serde_json::json!({});
        assert_eq!(job.trace_id(), None);
    }
}
