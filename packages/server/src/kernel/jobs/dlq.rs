//! Dead-letter mirror of jobs that exhausted their retry budget.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct DeadLetterJob {
    pub job_id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub failure_class: String,
    pub failure_message: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

/// Coarse failure class recorded on the dead-letter row, derived from the
/// final error message.
pub fn classify_failure(error: &str) -> &'static str {
    let lower = error.to_ascii_lowercase();
    if lower.contains("http_disabled") {
        "http_disabled"
    } else if lower.contains("circuit_open") {
        "circuit_open"
    } else if lower.contains("unauthorized") || lower.contains("401") {
        "auth"
    } else if lower.contains("429") || lower.contains("rate limit") {
        "rate_limited"
    } else if lower.contains("timeout") || lower.contains("connection") {
        "transport"
    } else {
        "handler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_failure_buckets_known_errors() {
        assert_eq!(classify_failure("circuit_open"), "circuit_open");
        assert_eq!(classify_failure("http_disabled"), "http_disabled");
        assert_eq!(classify_failure("vendor returned 429, rate limited"), "rate_limited");
        assert_eq!(classify_failure("connection reset by peer"), "transport");
        assert_eq!(classify_failure("consignment line missing sku"), "handler");
    }
}
