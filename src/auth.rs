use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::models::ErrorBody;
use crate::state::MonitoringAuth;

const API_KEY_HEADER: &str = "x-api-key";

// Key from x-api-key, falling back to "Authorization: Bearer <key>"
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

// compare digests so the check takes the same time for every wrong key length
fn keys_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// Gate for the monitoring endpoints.
///
/// Missing credentials are a 401, wrong ones a 403. Without a configured key
/// every request passes.
pub fn authorize(auth: &MonitoringAuth, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = auth.api_key.as_deref() else {
        return Ok(());
    };

    match presented_key(headers) {
        None | Some("") => Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("unauthorized", "Monitoring credentials required")),
        )
            .into_response()),
        Some(key) if keys_match(expected, key) => Ok(()),
        Some(_) => Err((
            StatusCode::FORBIDDEN,
            Json(ErrorBody::new("forbidden", "Invalid monitoring credentials")),
        )
            .into_response()),
    }
}
