mod health;
mod metrics;
mod proxy;

pub use health::{health_handler, health_head_handler};
pub use metrics::{metrics_handler, prometheus_handler};
pub use proxy::proxy_handler;

use axum::{Router, middleware, routing::get};
use std::sync::Arc;

use crate::middleware::{rate_limit, track_request};
use crate::state::AppState;

/// Monitoring routes plus the upstream fallback.
///
/// Requests pass `track_request` first, then `rate_limit`, then the handler.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler).head(health_head_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/metrics/prometheus", get(prometheus_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), track_request))
        .with_state(state)
}
