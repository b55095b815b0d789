//! Webhook intake pipeline and fan-out.
//!
//! Intake must ACK within five seconds, so nothing on this path calls the
//! vendor API: verification, persistence and child-job enqueues only. The
//! verify-or-drop policy is configurable (`webhook.verify_policy`) and
//! defaults to strict; `soft` preserves the legacy behavior of counting the
//! failure and processing anyway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::event::{bump_subscription, NewWebhookEvent, WebhookEvent};
use super::signature::{verify, SignatureKeys, VerifyOutcome};
use crate::kernel::jobs::JobType;
use crate::kernel::settings::{keys, SettingsStore};
use crate::kernel::{watchdog, ServerDeps};

/// Payload of the `webhook.event` queue-handoff job.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookEventJob {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug)]
pub struct IntakeRequest {
    pub body: String,
    /// Request headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub source_ip: Option<String>,
}

#[derive(Debug)]
pub enum IntakeReply {
    /// Webhooks are globally disabled; respond 403.
    Disabled,
    /// Strict policy rejected the request.
    Rejected(VerifyOutcome),
    Accepted {
        event_id: String,
        /// The provider redelivered an event already on file.
        duplicate: bool,
        child_job_id: Option<i64>,
        queued_job_id: Option<i64>,
    },
}

/// The closed routing table from webhook topics to fan-out child jobs.
pub fn route_event(topic: &str) -> Option<JobType> {
    match topic {
        "product.update" => Some(JobType::SyncProduct),
        "inventory.update" => Some(JobType::SyncInventory),
        "customer.update" => Some(JobType::SyncCustomer),
        "sale.update" => Some(JobType::SyncSale),
        _ => None,
    }
}

/// Pull the primary entity id out of the common payload locations.
pub fn extract_entity_id(payload: &Value) -> Option<String> {
    const CANDIDATES: [&str; 6] = [
        "product_id",
        "customer_id",
        "sale_id",
        "consignment_id",
        "entity_id",
        "id",
    ];
    for scope in [payload.get("data").unwrap_or(&Value::Null), payload] {
        for key in CANDIDATES {
            match scope.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Parse the body as JSON, or as form-encoded `payload=<json>`.
pub fn parse_event_body(body: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }
    for pair in body.split('&') {
        if let Some(encoded) = pair.strip_prefix("payload=") {
            let decoded = urlencoding::decode(encoded).ok()?;
            let decoded = decoded.replace('+', " ");
            return serde_json::from_str(&decoded).ok();
        }
    }
    None
}

/// Provider event id from the header, or a digest-derived stand-in.
pub fn derive_event_id(headers: &HashMap<String, String>, body: &str) -> String {
    if let Some(id) = headers.get("x-event-id").filter(|v| !v.is_empty()) {
        return id.clone();
    }
    let digest = Sha256::digest(body.as_bytes());
    format!("gen-{}", hex::encode(&digest[..16]))
}

/// Current + unexpired previous webhook secret.
pub async fn signature_keys(settings: &SettingsStore) -> Result<Option<SignatureKeys>> {
    let Some(current) = settings.get_fresh(keys::WEBHOOK_SECRET).await? else {
        return Ok(None);
    };

    let prev_key = format!("{}{}", keys::WEBHOOK_SECRET, keys::PREV_SUFFIX);
    let prev_expires_key = format!("{}{}", keys::WEBHOOK_SECRET, keys::PREV_EXPIRES_SUFFIX);
    let previous = match settings.get_fresh(&prev_key).await? {
        Some(prev) => {
            let expires_at = settings.get_i64_fresh(&prev_expires_key, 0).await?;
            (expires_at > Utc::now().timestamp()).then_some(prev)
        }
        None => None,
    };

    Ok(Some(SignatureKeys { current, previous }))
}

pub async fn handle_intake(deps: &Arc<ServerDeps>, req: IntakeRequest) -> Result<IntakeReply> {
    let settings = &deps.settings;
    let now = Utc::now().timestamp();

    if !settings.get_bool_fresh(keys::WEBHOOK_ENABLED, true).await? {
        return Ok(IntakeReply::Disabled);
    }

    let open_mode = settings
        .get_i64_fresh(keys::WEBHOOK_OPEN_MODE_UNTIL, 0)
        .await?
        > now;

    if !open_mode {
        let outcome = match signature_keys(settings).await? {
            Some(keys) => {
                let timestamp = req
                    .headers
                    .get("x-timestamp")
                    .and_then(|v| v.trim().parse::<i64>().ok());
                match req.headers.get("x-signature") {
                    Some(header) => verify(&req.body, timestamp, header, &keys, now),
                    None => VerifyOutcome::MissingSignature,
                }
            }
            None => {
                warn!("no webhook secret configured, accepting unverified event");
                VerifyOutcome::Valid
            }
        };

        if outcome != VerifyOutcome::Valid {
            deps.metrics
                .incr(&format!("webhook.verify_failed.{}", outcome.as_str()), 1)
                .await;
            settings
                .set_json(
                    keys::WEBHOOK_LAST_VERIFY_WARNING,
                    &json!({"reason": outcome.as_str(), "at": now}),
                )
                .await
                .ok();

            let strict = settings
                .get_fresh(keys::WEBHOOK_VERIFY_POLICY)
                .await?
                .map(|p| p != "soft")
                .unwrap_or(true);
            if strict {
                return Ok(IntakeReply::Rejected(outcome));
            }
            warn!(reason = outcome.as_str(), "webhook verification soft-failed, continuing");
        }
    }

    let payload = parse_event_body(&req.body);
    let topic = payload
        .as_ref()
        .and_then(|p| p.get("type"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| req.headers.get("x-event-type").cloned())
        .unwrap_or_else(|| "unknown".to_string());
    let event_id = derive_event_id(&req.headers, &req.body);

    let inserted = WebhookEvent::insert(
        deps.repo.pool(),
        NewWebhookEvent {
            event_id: event_id.clone(),
            topic: topic.clone(),
            raw_body: req.body.clone(),
            payload,
            headers: json!(req.headers),
            signature: req.headers.get("x-signature").cloned(),
            source_ip: req.source_ip,
            user_agent: req.headers.get("user-agent").cloned(),
        },
    )
    .await?;

    let Some(event) = inserted else {
        debug!(event_id = %event_id, "duplicate webhook delivery acknowledged");
        return Ok(IntakeReply::Accepted {
            event_id,
            duplicate: true,
            child_job_id: None,
            queued_job_id: None,
        });
    };

    bump_subscription(deps.repo.pool(), &topic).await;
    deps.metrics.incr("webhook.received_count", 1).await;

    let mut queued_job_id = None;
    if settings
        .get_bool_fresh(keys::WEBHOOK_QUEUE_HANDOFF, false)
        .await?
    {
        let job = deps
            .repo
            .enqueue(
                JobType::WebhookEvent,
                serde_json::to_value(WebhookEventJob {
                    event_id: event_id.clone(),
                    trace_id: Some(event_id.clone()),
                })?,
                Some(&format!("webhook:{}", event_id)),
                None,
            )
            .await?;
        WebhookEvent::mark_processing(deps.repo.pool(), &event_id, job.job_id()).await?;
        queued_job_id = Some(job.job_id());

        if settings.get_bool(keys::WATCHDOG_SPAWN_RUNNER, false).await? {
            watchdog::spawn_runner_best_effort();
        }
    }

    let mut child_job_id = None;
    if settings.get_bool_fresh(keys::WEBHOOK_INLINE, true).await? {
        let started = Instant::now();
        child_job_id = process_event(deps, &event).await?;
        deps.metrics.incr("webhook.processed_count", 1).await;
        deps.metrics
            .observe_ms(
                "webhook.processing_time_ms",
                started.elapsed().as_millis() as i64,
            )
            .await;
    }

    Ok(IntakeReply::Accepted {
        event_id,
        duplicate: false,
        child_job_id,
        queued_job_id,
    })
}

/// Fan a persisted webhook event out to its typed child job and mark it
/// completed. Shared by the inline path and the `webhook.event` handler.
pub async fn process_event(deps: &Arc<ServerDeps>, event: &WebhookEvent) -> Result<Option<i64>> {
    let Some(child_type) = route_event(&event.topic) else {
        debug!(topic = %event.topic, "no fan-out route for topic");
        WebhookEvent::mark_completed(deps.repo.pool(), &event.event_id).await?;
        return Ok(None);
    };

    let payload = event.payload.clone().unwrap_or(Value::Null);
    let entity_id = extract_entity_id(&payload);

    let child_payload = json!({
        "entity_id": entity_id,
        "event_id": event.event_id,
        "topic": event.topic,
        "data": payload.get("data").cloned().unwrap_or(Value::Null),
        "trace_id": event.event_id,
    });

    let idempotency = format!("fanout:{}:{}", event.topic, event.event_id);
    let result = deps
        .repo
        .enqueue(child_type, child_payload, Some(&idempotency), None)
        .await?;

    WebhookEvent::mark_completed(deps.repo.pool(), &event.event_id).await?;
    Ok(Some(result.job_id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_is_closed() {
        assert_eq!(route_event("product.update"), Some(JobType::SyncProduct));
        assert_eq!(route_event("inventory.update"), Some(JobType::SyncInventory));
        assert_eq!(route_event("customer.update"), Some(JobType::SyncCustomer));
        assert_eq!(route_event("sale.update"), Some(JobType::SyncSale));
        assert_eq!(route_event("product.delete"), None);
    }

    #[test]
    fn entity_id_found_in_common_locations() {
        assert_eq!(
            extract_entity_id(&json!({"data": {"product_id": 123}})).as_deref(),
            Some("123")
        );
        assert_eq!(
            extract_entity_id(&json!({"data": {"id": "abc"}})).as_deref(),
            Some("abc")
        );
        assert_eq!(
            extract_entity_id(&json!({"customer_id": "c-9"})).as_deref(),
            Some("c-9")
        );
        assert_eq!(extract_entity_id(&json!({"data": {}})), None);
    }

    #[test]
    fn body_parses_as_json_or_form_payload() {
        let parsed = parse_event_body(r#"{"type":"sale.update"}"#).unwrap();
        assert_eq!(parsed["type"], "sale.update");

        let form = "payload=%7B%22type%22%3A%22sale.update%22%7D";
        let parsed = parse_event_body(form).unwrap();
        assert_eq!(parsed["type"], "sale.update");

        assert!(parse_event_body("not json at all").is_none());
    }

    #[test]
    fn event_id_falls_back_to_body_digest() {
        let mut headers = HashMap::new();
        headers.insert("x-event-id".to_string(), "evt_1".to_string());
        assert_eq!(derive_event_id(&headers, "{}"), "evt_1");

        let generated = derive_event_id(&HashMap::new(), "{}");
        assert!(generated.starts_with("gen-"));
        // Same body, same synthetic id.
        assert_eq!(generated, derive_event_id(&HashMap::new(), "{}"));
    }
}
