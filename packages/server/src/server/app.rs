//! Application setup and router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::common::RequestId;
use crate::kernel::ServerDeps;
use crate::server::middleware::{
    admin_auth_middleware, extract_client_ip, rate_limit_middleware,
};
use crate::server::routes::{admin, health_handler, webhook_intake_handler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
}

/// Stamp every request with a correlation id, echoed in response envelopes.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestId::generate());
    next.run(request).await
}

/// Build the axum application router.
pub fn build_app(deps: Arc<ServerDeps>) -> Router {
    let state = AppState { deps };

    let admin_routes = Router::new()
        .route("/jobs", post(admin::enqueue_job))
        .route("/queue/pause", post(admin::pause_queue))
        .route("/queue/resume", post(admin::resume_queue))
        .route("/queue/concurrency", post(admin::set_concurrency))
        .route("/dlq/redrive", post(admin::redrive_dlq))
        .route("/status", get(admin::queue_status))
        .route("/metrics", get(admin::metrics_snapshot))
        .route("/oauth/refresh", post(admin::oauth_refresh))
        .route("/keys/rotate", post(admin::rotate_keys))
        .route("/webhooks/replay", post(admin::replay_webhooks))
        // Last added runs first: rate limiting, then bearer auth.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .nest("/admin", admin_routes)
        .route("/webhooks/vendor", post(webhook_intake_handler))
        // Health check (no auth, no rate limit)
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(extract_client_ip))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
