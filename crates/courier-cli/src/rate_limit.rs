//! Rate-limit middleware: per-client token buckets with IETF draft
//! `RateLimit-*` headers.
//!
//! Clients are keyed by forwarded IP (first `X-Forwarded-For` entry), then
//! the direct peer address, then `"unknown"`. Health probes, auth
//! endpoints, and streaming paths are exempt.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use courier_core::limiter::RateLimiter;

/// Path prefixes never rate limited.
const EXEMPT_PREFIXES: &[&str] = &["/api/health", "/api/auth", "/api/ws"];

fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || path.ends_with("/events")
}

fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_value(n: u32) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).expect("digits are valid header bytes")
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(request).await;
    }

    let client = client_key(&request);
    let decision = limiter.check(&client);

    if !decision.allowed {
        let retry_after = (decision.retry_after * 10.0).round() / 10.0;
        tracing::warn!(
            client = %client,
            path = %path,
            retry_after = retry_after,
            "request rate limited"
        );
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Too many requests",
                "retry_after_seconds": retry_after,
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(
            "Retry-After",
            header_value(decision.retry_after as u32 + 1),
        );
        headers.insert("RateLimit-Limit", header_value(decision.limit));
        headers.insert("RateLimit-Remaining", header_value(0));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("RateLimit-Limit", header_value(decision.limit));
    headers.insert("RateLimit-Remaining", header_value(decision.remaining));
    response
}
