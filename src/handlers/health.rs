use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::auth::authorize;
use crate::models::HealthResponse;
use crate::state::AppState;

// GET /api/health - every check plus a metrics snapshot
pub async fn health_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state.auth, &headers) {
        return rejection;
    }

    let report = state.health.run_all_checks().await;
    let healthy = report.is_healthy();

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: state.metrics.uptime().as_secs(),
        checks: report.checks,
        metrics: state.metrics.snapshot(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// HEAD /api/health - status code only, from a single check
pub async fn health_head_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.health.run_check(&state.liveness_check).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
