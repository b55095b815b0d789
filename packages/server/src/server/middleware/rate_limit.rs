//! Per-IP rate limiting over the shared minute-bucket table.
//!
//! The limiter rides the same `metric_buckets` storage as the metrics sink,
//! so the budget is enforced across every worker process. A database error
//! lets the request through: availability wins over strictness here.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::common::{Envelope, RequestId};
use crate::kernel::settings::keys;
use crate::server::app::AppState;
use crate::server::middleware::ClientIp;

const DEFAULT_PER_MINUTE: i64 = 120;

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate);

    let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>().cloned() else {
        return next.run(request).await;
    };

    let limit = state
        .deps
        .settings
        .get_i64(keys::RATE_LIMIT_PER_MINUTE, DEFAULT_PER_MINUTE)
        .await
        .unwrap_or(DEFAULT_PER_MINUTE);

    match state
        .deps
        .bucket_metrics
        .incr_and_get(&format!("ratelimit:ip:{}", ip), 1)
        .await
    {
        Ok(count) if count > limit => {
            state.deps.metrics.incr("admin.rate_limited", 1).await;
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", "60")],
                axum::Json(Envelope::err(
                    "rate_limited",
                    "per-minute request budget exceeded",
                    &request_id,
                )),
            )
                .into_response()
        }
        Ok(_) => next.run(request).await,
        Err(e) => {
            warn!(error = %e, "rate limit bucket unavailable, allowing request");
            next.run(request).await
        }
    }
}
