use std::sync::Arc;

use crate::cache::TtlCache;
use crate::health::HealthChecker;
use crate::metrics::MetricsRegistry;
use crate::models::CachedResponse;
use crate::rate_limit::{RateLimitPolicies, RateLimiter};

// Monitoring endpoint access
#[derive(Debug, Clone, Default)]
pub struct MonitoringAuth {
    // Some only when running in production with a key configured
    pub api_key: Option<String>,
}

impl MonitoringAuth {
    pub fn open() -> Self {
        Self { api_key: None }
    }

    pub fn required(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
        }
    }
}

// app's shared state, built once in main and torn down on shutdown
pub struct AppState {
    pub client: reqwest::Client,
    pub upstream: String, // base URL, no trailing slash
    pub limiter: Arc<RateLimiter>,
    pub policies: RateLimitPolicies,
    pub metrics: Arc<MetricsRegistry>,
    pub health: Arc<HealthChecker>,
    pub ai_cache: Arc<TtlCache<CachedResponse>>,
    pub liveness_check: String, // probe behind HEAD /api/health
    pub auth: MonitoringAuth,
}
