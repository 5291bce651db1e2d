use axum::{
    Json,
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::cache::make_cache_key;
use crate::models::{CachedResponse, ErrorBody};
use crate::state::AppState;

pub(crate) const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const AI_PREFIX: &str = "/api/ai/";

// Hop-by-hop and framing headers are never forwarded
const SKIPPED_HEADERS: [header::HeaderName; 9] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in SKIPPED_HEADERS {
        out.remove(name);
    }
    out.remove("keep-alive");
    out
}

// Every cookie header value, joined the way a single header would carry them
fn cookies(headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        if !out.is_empty() {
            out.extend_from_slice(b"; ");
        }
        out.extend_from_slice(value.as_bytes());
    }
    out
}

// Read the upstream body, Ok(None) once it grows past `limit`
async fn read_capped(
    upstream: &mut reqwest::Response,
    limit: usize,
) -> Result<Option<Bytes>, reqwest::Error> {
    if upstream.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = upstream.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(Bytes::from(body)))
}

fn is_ai_request(method: &Method, path: &str) -> bool {
    method == Method::POST && path.starts_with(AI_PREFIX)
}

fn bad_gateway(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody::new("bad_gateway", message)),
    )
        .into_response()
}

fn cached_response(cached: CachedResponse, cache_status: &'static str) -> Response {
    let mut response = (cached.status, cached.headers, cached.body).into_response();
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(cache_status));
    response
}

/// Forward anything not handled locally to the upstream app.
///
/// Successful AI coaching responses are cached by path, credentials (bearer
/// token and cookies) and body. `Set-Cookie` is never stored.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let body: Bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorBody::new("payload_too_large", "Request body is too large")),
            )
                .into_response();
        }
    };

    let cache_key = is_ai_request(&parts.method, parts.uri.path()).then(|| {
        let caller = parts
            .headers
            .get(header::AUTHORIZATION)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        let cookie = cookies(&parts.headers);
        make_cache_key(&[path_and_query.as_bytes(), caller, &cookie[..], &body[..]])
    });

    if let Some(key) = &cache_key {
        if let Some(hit) = state.ai_cache.get(key) {
            state.metrics.increment_counter("ai_cache_hits");
            debug!(path = %path_and_query, "AI cache hit");
            return cached_response(hit, "HIT");
        }
        state.metrics.increment_counter("ai_cache_misses");
    }

    let url = format!("{}{}", state.upstream, path_and_query);
    let result = state
        .client
        .request(parts.method.clone(), &url)
        .headers(forwardable(&parts.headers))
        .body(body)
        .send()
        .await;

    let mut upstream = match result {
        Ok(res) => res,
        Err(e) => {
            error!(url = %url, error = %e, "Upstream request failed");
            state.metrics.record_error("upstream_error");
            return bad_gateway("Upstream service unavailable");
        }
    };

    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    let body = match read_capped(&mut upstream, MAX_BODY_BYTES).await {
        Ok(Some(body)) => body,
        Ok(None) => {
            error!(url = %url, limit = MAX_BODY_BYTES, "Upstream response is too large");
            state.metrics.record_error("upstream_too_large");
            return bad_gateway("Upstream response is too large");
        }
        Err(e) => {
            error!(url = %url, error = %e, "Failed to read upstream response");
            state.metrics.record_error("upstream_error");
            return bad_gateway("Upstream response was incomplete");
        }
    };

    let response = CachedResponse {
        status,
        headers,
        body,
    };

    match cache_key {
        Some(key) if status.is_success() => {
            let mut stored = response.clone();
            stored.headers.remove(header::SET_COOKIE);
            state.ai_cache.insert(key, stored);
            cached_response(response, "MISS")
        }
        Some(_) => cached_response(response, "MISS"),
        None => (response.status, response.headers, Body::from(response.body)).into_response(),
    }
}
