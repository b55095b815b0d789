//! Bearer-token authorization for the admin surface.
//!
//! The token lives in the settings store; during rotation the previous token
//! is accepted until its overlap window expires. Comparison goes through a
//! digest so equality checking is constant-time in the secret.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::common::{Envelope, RequestId};
use crate::kernel::settings::keys;
use crate::server::app::AppState;

/// Constant-time secret comparison via digest equality.
pub fn secret_matches(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate);

    // Incident-mode override, off unless explicitly set.
    let auth_disabled = state
        .deps
        .settings
        .get_bool_fresh(keys::ADMIN_AUTH_DISABLED, false)
        .await
        .unwrap_or(false);
    if auth_disabled {
        warn!("admin auth override active, allowing request without token");
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string());

    let Some(provided) = provided else {
        return unauthorized(&request_id, "missing bearer token");
    };

    if authorized(&state, &provided).await {
        next.run(request).await
    } else {
        unauthorized(&request_id, "invalid bearer token")
    }
}

async fn authorized(state: &AppState, provided: &str) -> bool {
    let settings = &state.deps.settings;

    let Ok(current) = settings.get_fresh(keys::ADMIN_BEARER_TOKEN).await else {
        return false;
    };
    if let Some(current) = current {
        if secret_matches(provided, &current) {
            return true;
        }
    }

    // Previous token during rotation overlap.
    let prev_key = format!("{}{}", keys::ADMIN_BEARER_TOKEN, keys::PREV_SUFFIX);
    let prev_expires_key = format!("{}{}", keys::ADMIN_BEARER_TOKEN, keys::PREV_EXPIRES_SUFFIX);
    let previous = settings.get_fresh(&prev_key).await.ok().flatten();
    let expires_at = settings.get_i64_fresh(&prev_expires_key, 0).await.unwrap_or(0);
    if let Some(previous) = previous {
        if expires_at > Utc::now().timestamp() && secret_matches(provided, &previous) {
            return true;
        }
    }
    false
}

fn unauthorized(request_id: &RequestId, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(Envelope::err("unauthorized", message, request_id)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_matches_exact_strings_only() {
        assert!(secret_matches("tok_abc", "tok_abc"));
        assert!(!secret_matches("tok_abc", "tok_abd"));
        assert!(!secret_matches("tok_abc", "tok_abc "));
        assert!(!secret_matches("", "tok_abc"));
    }
}
