//! Request-path middleware: rate limiting and request tracking.

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::ErrorBody;
use crate::rate_limit::{RateLimitDecision, RateLimitPreset};
use crate::state::AppState;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const REQUEST_TIMER: &str = "http_request";

/// Best guess at the caller's address from proxy headers.
///
/// `cf-connecting-ip`, then `x-real-ip`, then the first `x-forwarded-for` hop.
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("cf-connecting-ip")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .unwrap_or("unknown")
        .to_string()
}

// health and metrics are polled by infrastructure and never limited
fn is_monitoring_path(path: &str) -> bool {
    ["/api/health", "/api/metrics"].iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

fn too_many_requests(decision: &RateLimitDecision, retry_after: u64) -> Response {
    let body = ErrorBody {
        error: "rate_limit_exceeded".to_string(),
        message: format!("Too many requests. Please try again in {retry_after} seconds."),
        retry_after: Some(retry_after),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_rate_limit_headers(headers, decision);
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Count the request against its route's policy, short-circuiting with 429.
///
/// Limiter failures let the request through.
pub async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if is_monitoring_path(path) {
        return next.run(request).await;
    }

    let preset = RateLimitPreset::for_path(path);
    let ip = client_ip(request.headers());
    let identifier = format!("{}:{}", preset.name(), ip);

    let decision = match state.limiter.check(&identifier, state.policies.get(preset)) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "Rate limiter failed, allowing request");
            state.metrics.record_error("limiter_error");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        let retry_after = state
            .limiter
            .now_millis()
            .map(|now| decision.retry_after_secs(now))
            .unwrap_or(1);
        debug!(identifier = %identifier, retry_after, "Rate limit exceeded");
        state.metrics.increment_counter("rate_limited_requests");
        state.metrics.record_error("rate_limited");
        return too_many_requests(&decision, retry_after);
    }

    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

// Inbound ids are kept when they look like ids, anything else is replaced
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| {
            !v.is_empty()
                && v.len() <= 128
                && v.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Tag the request with an id, time it and count the response.
pub async fn track_request(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let id = request_id(request.headers());
    let header_value = HeaderValue::from_str(&id).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(REQUEST_ID, value.clone());
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // the inbound id is caller-controlled, so the timer gets a key of its own
    let timer_key = Uuid::new_v4().to_string();
    state.metrics.increment_counter("http_requests_total");
    state.metrics.start_timer(REQUEST_TIMER, &timer_key);

    let mut response = next.run(request).await;

    let status = response.status();
    let elapsed = match state.metrics.end_timer(REQUEST_TIMER, &timer_key) {
        Ok(elapsed) => elapsed,
        Err(e) => {
            warn!(request_id = %id, error = %e, "Request timer missing");
            Default::default()
        }
    };

    let class = match status.as_u16() {
        100..=199 => "http_responses_1xx",
        200..=299 => "http_responses_2xx",
        300..=399 => "http_responses_3xx",
        400..=499 => "http_responses_4xx",
        _ => "http_responses_5xx",
    };
    state.metrics.increment_counter(class);
    if status.is_server_error() {
        state.metrics.record_error("server_error");
    }

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID, value);
    }

    debug!(
        request_id = %id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
        "Request processed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn client_ip_prefers_cloudflare_then_real_ip() {
        let all = headers(&[
            ("cf-connecting-ip", "1.1.1.1"),
            ("x-real-ip", "2.2.2.2"),
            ("x-forwarded-for", "3.3.3.3, 4.4.4.4"),
        ]);
        assert_eq!(client_ip(&all), "1.1.1.1");

        let no_cf = headers(&[("x-real-ip", "2.2.2.2"), ("x-forwarded-for", "3.3.3.3")]);
        assert_eq!(client_ip(&no_cf), "2.2.2.2");
    }

    #[test]
    fn client_ip_uses_first_forwarded_hop() {
        let forwarded = headers(&[("x-forwarded-for", " 3.3.3.3 , 4.4.4.4")]);
        assert_eq!(client_ip(&forwarded), "3.3.3.3");
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
        assert_eq!(client_ip(&headers(&[("x-real-ip", "  ")])), "unknown");
    }

    #[test]
    fn monitoring_paths_are_exempt() {
        assert!(is_monitoring_path("/api/health"));
        assert!(is_monitoring_path("/api/metrics/prometheus"));
        assert!(!is_monitoring_path("/api/healthy-recipes"));
        assert!(!is_monitoring_path("/api/posts"));
    }

    #[test]
    fn request_ids_are_reused_only_when_sane() {
        assert_eq!(request_id(&headers(&[("x-request-id", "abc-123")])), "abc-123");

        let replaced = request_id(&headers(&[("x-request-id", "has spaces")]));
        assert_ne!(replaced, "has spaces");
        assert!(Uuid::parse_str(&replaced).is_ok());
    }
}
