//! Request middleware chain (§5 Connections, timeouts and authentication).
//!
//! Built as `axum::middleware::from_fn` layers composed on a
//! `ServiceBuilder` (request-id stamping, request logging), grounded in
//! `irobot/httpd/_middleware.py`'s `log_connections`/`catch500`/`timeout`/
//! `authentication`, applied outermost-first in that order.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use super::AppState;
use crate::auth::authenticate_with;
use crate::config::DurationLimit;
use crate::errors::GatewayError;

/// Stamp every request/response pair with an `X-Request-ID`, generating one
/// when the client doesn't supply it.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// Track active/total connection counters on [`AppState`] for the `/_status`
/// admin endpoint (§4.4, grounded in `_middleware.py::log_connections`).
pub async fn connection_accounting_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    state.active_connections.fetch_add(1, Ordering::SeqCst);
    state.total_connections.fetch_add(1, Ordering::SeqCst);

    let response = next.run(request).await;

    state.active_connections.fetch_sub(1, Ordering::SeqCst);
    response
}

/// Log method/path/status/duration for every request, and set
/// `X-Response-Time` on the way out.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    tracing::info!(%method, %uri, "request received");
    let mut response = next.run(request).await;

    let elapsed = started.elapsed();
    tracing::info!(%method, %uri, status = %response.status().as_u16(), duration_ms = elapsed.as_millis() as u64, "request completed");

    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
        response.headers_mut().insert("X-Response-Time", value);
    }
    response
}

/// Bound the whole request by the configured response timeout, returning
/// `504 Gateway Timeout` if it's exceeded (§5 Suspension/blocking, grounded
/// in `_middleware.py::timeout`).
pub async fn timeout_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let DurationLimit::Finite(limit) = state.response_timeout else {
        return next.run(request).await;
    };

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => GatewayError::Timeout.into_response(),
    }
}

/// Dispatch the `Authorization` header to the configured handlers, storing
/// the authenticated user on the request for downstream handlers (§4.4
/// Design Note on pluggable authentication).
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match authenticate_with(&state.auth_handlers, auth_header).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Permissive CORS: this gateway fronts programmatic clients, not browser
/// pages with credentials to protect.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600))
}
