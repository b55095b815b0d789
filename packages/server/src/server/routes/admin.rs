//! Admin surface: enqueue, queue controls, DLQ redrive, status, metrics,
//! token refresh and key rotation. Every response uses the JSON envelope.

use std::collections::HashMap;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::common::envelope::EnvelopeResponse;
use crate::common::{Envelope, RequestId};
use crate::kernel::jobs::JobType;
use crate::kernel::settings::keys;
use crate::kernel::watchdog::{Banner, Watchdog};
use crate::kernel::webhooks::WebhookEvent;
use crate::server::app::AppState;

fn ok(data: Value, request_id: &RequestId) -> EnvelopeResponse {
    EnvelopeResponse(StatusCode::OK, Envelope::ok(data, request_id))
}

fn bad_request(message: impl Into<String>, request_id: &RequestId) -> EnvelopeResponse {
    EnvelopeResponse(
        StatusCode::BAD_REQUEST,
        Envelope::err("bad_request", message, request_id),
    )
}

fn internal(error: anyhow::Error, request_id: &RequestId) -> EnvelopeResponse {
    error!(error = %error, "admin request failed");
    EnvelopeResponse(
        StatusCode::INTERNAL_SERVER_ERROR,
        Envelope::err("internal", error.to_string(), request_id),
    )
}

// ----------------------------------------------------------------------
// Enqueue
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i16>,
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<EnqueueRequest>,
) -> EnvelopeResponse {
    let Some(job_type) = JobType::parse(&req.job_type) else {
        return bad_request(format!("unknown job type: {}", req.job_type), &request_id);
    };
    if let Some(key) = &req.idempotency_key {
        if key.is_empty() || key.len() > 128 {
            return bad_request("idempotency_key must be 1..=128 characters", &request_id);
        }
    }

    match state
        .deps
        .repo
        .enqueue(
            job_type,
            req.payload,
            req.idempotency_key.as_deref(),
            req.priority,
        )
        .await
    {
        Ok(result) => ok(
            json!({"job_id": result.job_id(), "duplicate": !result.is_created()}),
            &request_id,
        ),
        Err(e) => internal(e, &request_id),
    }
}

// ----------------------------------------------------------------------
// Pause / resume / concurrency
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    /// Absent means all types.
    #[serde(rename = "type", default)]
    pub job_type: Option<String>,
}

pub async fn pause_queue(
    state: State<AppState>,
    request_id: Extension<RequestId>,
    req: Json<PauseRequest>,
) -> EnvelopeResponse {
    set_pause(state, request_id, req, true).await
}

pub async fn resume_queue(
    state: State<AppState>,
    request_id: Extension<RequestId>,
    req: Json<PauseRequest>,
) -> EnvelopeResponse {
    set_pause(state, request_id, req, false).await
}

async fn set_pause(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<PauseRequest>,
    paused: bool,
) -> EnvelopeResponse {
    let targets: Vec<JobType> = match &req.job_type {
        Some(raw) => match JobType::parse(raw) {
            Some(t) => vec![t],
            None => return bad_request(format!("unknown job type: {}", raw), &request_id),
        },
        None => JobType::ALL.to_vec(),
    };

    for job_type in &targets {
        if let Err(e) = state
            .deps
            .settings
            .set_bool(&keys::pause_flag(job_type.as_str()), paused)
            .await
        {
            return internal(e, &request_id);
        }
    }

    info!(paused, count = targets.len(), "queue pause flags updated");
    ok(
        json!({
            "paused": paused,
            "types": targets.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        }),
        &request_id,
    )
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub cap: i64,
}

pub async fn set_concurrency(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ConcurrencyRequest>,
) -> EnvelopeResponse {
    let Some(job_type) = JobType::parse(&req.job_type) else {
        return bad_request(format!("unknown job type: {}", req.job_type), &request_id);
    };
    if !(0..=50).contains(&req.cap) {
        return bad_request("cap must be within 0..=50", &request_id);
    }

    match state
        .deps
        .settings
        .set_i64(&keys::concurrency_cap(job_type.as_str()), req.cap)
        .await
    {
        Ok(()) => ok(
            json!({"type": job_type.as_str(), "cap": req.cap}),
            &request_id,
        ),
        Err(e) => internal(e, &request_id),
    }
}

// ----------------------------------------------------------------------
// DLQ redrive
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RedriveRequest {
    #[serde(default)]
    pub ids: Option<Vec<i64>>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn redrive_dlq(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<RedriveRequest>,
) -> EnvelopeResponse {
    let result = match (&req.ids, req.mode.as_deref()) {
        (Some(ids), _) if !ids.is_empty() => {
            if ids.len() > 500 {
                return bad_request("at most 500 ids per redrive", &request_id);
            }
            state.deps.repo.redrive_ids(ids).await
        }
        (_, Some("oldest")) => {
            let limit = req.limit.unwrap_or(100);
            if !(1..=500).contains(&limit) {
                return bad_request("limit must be within 1..=500", &request_id);
            }
            state.deps.repo.redrive_oldest(limit).await
        }
        _ => return bad_request("provide ids or mode=\"oldest\"", &request_id),
    };

    match result {
        Ok(moved) => ok(json!({"redriven": moved}), &request_id),
        Err(e) => internal(e, &request_id),
    }
}

// ----------------------------------------------------------------------
// Status / metrics
// ----------------------------------------------------------------------

pub async fn queue_status(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> EnvelopeResponse {
    let deps = &state.deps;

    let gauges = match deps.repo.gauges().await {
        Ok(g) => g,
        Err(e) => return internal(e, &request_id),
    };
    let mut per_type = HashMap::new();
    for job_type in JobType::ALL {
        let gauge = gauges.get(job_type.as_str()).cloned().unwrap_or_default();
        let paused = deps
            .settings
            .get_bool_fresh(&keys::pause_flag(job_type.as_str()), false)
            .await
            .unwrap_or(false);
        per_type.insert(
            job_type.as_str(),
            json!({"pending": gauge.pending, "working": gauge.working, "paused": paused}),
        );
    }

    let dlq = deps.repo.dlq_count().await.unwrap_or(0);
    let breaker = deps.vendor.breaker().state().await.unwrap_or_default();
    let banner = deps
        .settings
        .get_json::<Banner>(keys::WATCHDOG_BANNER)
        .await
        .ok()
        .flatten();
    let watchdog = Watchdog::new(state.deps.clone()).report().await.ok();

    ok(
        json!({
            "types": per_type,
            "dead_letter_count": dlq,
            "circuit_breaker": breaker,
            "banner": banner,
            "watchdog": watchdog,
        }),
        &request_id,
    )
}

pub async fn metrics_snapshot(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> EnvelopeResponse {
    match state.deps.bucket_metrics.snapshot(15).await {
        Ok(rows) => ok(json!({"window_minutes": 15, "counters": rows}), &request_id),
        Err(e) => internal(e, &request_id),
    }
}

// ----------------------------------------------------------------------
// OAuth refresh / key rotation / webhook replay
// ----------------------------------------------------------------------

pub async fn oauth_refresh(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> EnvelopeResponse {
    match state.deps.oauth.force_refresh().await {
        Ok(_) => ok(json!({"refreshed": true}), &request_id),
        Err(e) => internal(e, &request_id),
    }
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    /// `admin_bearer` or `webhook_secret`.
    pub target: String,
    pub overlap_minutes: i64,
    #[serde(default)]
    pub new_secret: Option<String>,
}

pub async fn rotate_keys(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<RotateRequest>,
) -> EnvelopeResponse {
    let setting_key = match req.target.as_str() {
        "admin_bearer" => keys::ADMIN_BEARER_TOKEN,
        "webhook_secret" => keys::WEBHOOK_SECRET,
        other => return bad_request(format!("unknown rotation target: {}", other), &request_id),
    };
    if !(1..=1440).contains(&req.overlap_minutes) {
        return bad_request("overlap_minutes must be within 1..=1440", &request_id);
    }

    let settings = &state.deps.settings;
    let current = match settings.get_fresh(setting_key).await {
        Ok(v) => v,
        Err(e) => return internal(e, &request_id),
    };

    let new_secret = req
        .new_secret
        .clone()
        .unwrap_or_else(|| format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()));

    let prev_key = format!("{}{}", setting_key, keys::PREV_SUFFIX);
    let prev_expires_key = format!("{}{}", setting_key, keys::PREV_EXPIRES_SUFFIX);
    let overlap_until = Utc::now().timestamp() + req.overlap_minutes * 60;

    let result: anyhow::Result<()> = async {
        if let Some(current) = current {
            settings.set(&prev_key, &current).await?;
            settings.set_i64(&prev_expires_key, overlap_until).await?;
        }
        settings.set(setting_key, &new_secret).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(target = %req.target, overlap_minutes = req.overlap_minutes, "secret rotated");
            ok(
                json!({
                    "target": req.target,
                    "overlap_until": overlap_until,
                    "new_secret": new_secret,
                }),
                &request_id,
            )
        }
        Err(e) => internal(e, &request_id),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub event_ids: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn replay_webhooks(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ReplayRequest>,
) -> EnvelopeResponse {
    if req.event_ids.is_empty() {
        return bad_request("event_ids must not be empty", &request_id);
    }
    let reason = req.reason.as_deref().unwrap_or("admin replay");

    match WebhookEvent::mark_replayed(state.deps.repo.pool(), &req.event_ids, reason).await {
        Ok(marked) => ok(json!({"replayed": marked}), &request_id),
        Err(e) => internal(e, &request_id),
    }
}
