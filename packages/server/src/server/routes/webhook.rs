//! Vendor webhook intake route.
//!
//! Thin axum shim over the kernel intake pipeline: collect headers and body,
//! run the pipeline, map the reply onto the wire. The 5-second ACK budget is
//! honored by construction: nothing here calls the vendor API.

use std::collections::HashMap;

use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::common::RequestId;
use crate::kernel::settings::keys;
use crate::kernel::webhooks::{handle_intake, IntakeReply, IntakeRequest, VerifyOutcome};
use crate::server::app::AppState;
use crate::server::middleware::ClientIp;

pub async fn webhook_intake_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    client_ip: Option<Extension<ClientIp>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_ascii_lowercase(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let request = IntakeRequest {
        body,
        headers,
        source_ip: client_ip.map(|Extension(ClientIp(ip))| ip.to_string()),
    };

    let reply = match handle_intake(&state.deps, request).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = %e, "webhook intake failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "internal", "request_id": request_id.0})),
            )
                .into_response();
        }
    };

    match reply {
        IntakeReply::Disabled => (
            StatusCode::FORBIDDEN,
            Json(json!({"ok": false, "error": "disabled"})),
        )
            .into_response(),
        IntakeReply::Rejected(outcome) => {
            let status = match outcome {
                VerifyOutcome::Stale => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNAUTHORIZED,
            };
            (
                status,
                Json(json!({"ok": false, "error": outcome.as_str()})),
            )
                .into_response()
        }
        IntakeReply::Accepted {
            event_id,
            duplicate,
            child_job_id,
            queued_job_id,
        } => {
            let respond_204 = state
                .deps
                .settings
                .get_bool(keys::WEBHOOK_RESPOND_204, false)
                .await
                .unwrap_or(false);
            if respond_204 {
                return StatusCode::NO_CONTENT.into_response();
            }
            Json(json!({
                "ok": true,
                "event_id": event_id,
                "duplicate": duplicate,
                "job_id": queued_job_id.or(child_job_id),
            }))
            .into_response()
        }
    }
}
