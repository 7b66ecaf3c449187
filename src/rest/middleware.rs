//! Authentication (scoped to `/api/v1`) and rate-limit middleware (spec §4.2).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::rest::error::ApiError;
use crate::rest::AppState;
use crate::security;

/// Skipped entirely when the configured API key is empty (a warning is
/// logged once at startup instead, see `Server::bind`).
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.api_key.is_empty() {
        return next.run(req).await;
    }

    match extract_api_key(req.headers()) {
        Some(key) if security::keys_match(&key, &state.config.api_key) => next.run(req).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

/// `Authorization:` (stripping a `Bearer ` prefix if present), falling back
/// to `X-API-Key:`.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return Some(
            value
                .strip_prefix("Bearer ")
                .unwrap_or(value)
                .to_string(),
        );
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Keyed by the IP host component of the remote address. On denial, `429`
/// with `Retry-After: 1`.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let key = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.rate_limiter.allow(&key) {
        return next.run(req).await;
    }

    let mut response = ApiError::RateLimitExceeded.into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_api_key_strips_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_api_key(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_api_key_uses_raw_authorization_without_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("abc123"));
        assert_eq!(extract_api_key(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_api_key_falls_back_to_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_api_key(&headers), Some("xyz".to_string()));
    }

    #[test]
    fn extract_api_key_none_when_absent() {
        let headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);
    }
}
