//! Health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::warn;
use utoipa::OpenApi;

use crate::schemas::health::{HealthResponse, QueueDepthsResponse, WebhookStatsResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_health),
    components(schemas(HealthResponse, WebhookStatsResponse, QueueDepthsResponse))
)]
pub struct HealthApi;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Liveness plus the webhook delivery counters and queue depths.
///
/// Permanently failed webhook deliveries are only ever reported here and in
/// the logs; they never change a task's status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queues = match state.service.queue_depths().await {
        Ok(depths) => Some(depths.into()),
        Err(e) => {
            warn!(error = %e, "failed to read queue depths");
            None
        }
    };
    Json(HealthResponse {
        status: "ok".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        webhooks: state.metrics.snapshot().into(),
        queues,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
