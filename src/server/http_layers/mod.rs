//! Request middleware: API-key enforcement and request telemetry.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Instant;
use tracing::info;

use super::metrics::record_http_request;
use super::state::ServerState;

/// Routes reachable without an API key even when one is configured.
fn is_exempt(path: &str) -> bool {
    path == "/" || path == "/v1/health"
}

pub async fn require_api_key(
    State(state): State<ServerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected.trim()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid API key."})),
        )
            .into_response();
    }
    next.run(request).await
}

/// Assigns a request id, logs the request line with latency, and records the
/// Prometheus counters. Every response carries `X-Request-ID`.
pub async fn telemetry(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;

    let status = response.status().as_u16();
    let duration = start.elapsed();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    record_http_request(&method, &path, status, duration);
    info!(
        request_id = %request_id,
        "{} {} -> {} ({}ms)",
        method,
        path,
        status,
        duration.as_millis()
    );

    response
}
