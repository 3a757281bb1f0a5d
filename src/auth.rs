//! Pre-shared API key authentication.
//!
//! REST endpoints other than the health probe expect
//! `Authorization: Bearer <key>`. Terminal WebSocket upgrades carry the key
//! as a `?token=` query parameter instead, since browsers offer no way to
//! attach headers to an upgrade request. One key, one tenant.

use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// The expected key, injected as a router-level extension so the middleware
/// has no dependency on `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Middleware guarding the REST surface.
///
/// Responds `401` when no Bearer token is present, `403` when the token does
/// not match, and `500` when the [`ApiKey`] extension was never installed
/// (a wiring bug, not a client error).
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "API key extension missing",
        );
    };

    let Some(provided) = bearer_token(request.headers()) else {
        return reject(StatusCode::UNAUTHORIZED, "Bearer token required");
    };

    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        next.run(request).await
    } else {
        reject(StatusCode::FORBIDDEN, "API key rejected")
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Pull the token out of an `Authorization: Bearer …` header, if one exists.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Timing-safe equality against the configured key.
///
/// Walks every byte of `expected` no matter where a mismatch occurs, with a
/// fixed pad standing in for missing `provided` bytes, so response timing
/// reveals neither the key length nor a matching prefix.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &byte) in expected.iter().enumerate() {
        diff |= byte ^ provided.get(i).copied().unwrap_or(0xaa);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_eq_matches() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_eq_rejects() {
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.clear();
        assert_eq!(bearer_token(&headers), None);
    }
}
