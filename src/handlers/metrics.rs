use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::auth::authorize;
use crate::models::ErrorBody;
use crate::state::AppState;

// GET /api/metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state.auth, &headers) {
        return rejection;
    }
    Json(state.metrics.snapshot()).into_response()
}

// GET /api/metrics/prometheus
pub async fn prometheus_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state.auth, &headers) {
        return rejection;
    }

    match state.metrics.render_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("internal_error", "Failed to collect metrics")),
            )
                .into_response()
        }
    }
}
