//! # HTTP Core
//!
//! Per-request state machine: auth -> route -> delegate -> stream (§4.4).
//! Shared state and router assembly live here; the global middleware order
//! is grounded in `irobot/httpd/server.py`, composed via a `ServiceBuilder`
//! stack of request-id, CORS, tracing and the chain §4.4/§5 specify.

pub mod handlers;
pub mod middleware;
pub mod multipart;
pub mod range;
pub mod responses;

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;

use crate::auth::Authenticator;
use crate::config::{Config, DurationLimit};
use crate::errors::GatewayError;
use crate::precache::PrecacheManager;
use crate::tracking::TrackingStore;

/// Shared, cheaply-cloned state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub precache: Arc<PrecacheManager>,
    pub store: Arc<TrackingStore>,
    pub config: Arc<Config>,
    pub auth_handlers: Vec<Arc<dyn Authenticator>>,
    pub response_timeout: DurationLimit,
    pub active_connections: Arc<AtomicI64>,
    pub total_connections: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        precache: Arc<PrecacheManager>,
        store: Arc<TrackingStore>,
        config: Arc<Config>,
        auth_handlers: Vec<Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            response_timeout: config.httpd.timeout,
            precache,
            store,
            config,
            auth_handlers,
            active_connections: Arc::new(AtomicI64::new(0)),
            total_connections: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Converts a caught panic into the standard error body instead of an
/// opaque empty 500 (grounded in `_middleware.py::catch500`).
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };

    tracing::error!(panic = %message, "request handler panicked");
    GatewayError::Internal(message).into_response()
}

/// Assemble the full router: the fixed admin surface plus the catch-all
/// data-object endpoint, wrapped in the global middleware chain.
///
/// Middleware nests outermost-first as declared here (each `.layer` call on
/// a `ServiceBuilder` wraps around the ones below it): request
/// logging/identification and CORS are this crate's ambient additions, then
/// exactly the chain §4.4 specifies -- connection accounting, catch-500,
/// per-request timeout, authentication -- closest to the handlers.
pub fn build_router(state: AppState) -> Router {
    let chain = ServiceBuilder::new()
        .layer(axum::middleware::from_fn(middleware::request_logging_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(middleware::cors_layer())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::connection_accounting_middleware,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::timeout_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .route("/_status", get(handlers::admin::status).head(handlers::admin::status))
        .route("/_config", get(handlers::admin::config).head(handlers::admin::config))
        .route("/_precache", get(handlers::admin::precache).head(handlers::admin::precache))
        .route(
            "/{*irods_path}",
            get(handlers::data::get_or_head)
                .head(handlers::data::get_or_head)
                .post(handlers::data::post)
                .delete(handlers::data::delete),
        )
        .fallback(not_found)
        .layer(chain)
        .with_state(state)
}

async fn not_found() -> Response {
    GatewayError::NotFound("no such route".into()).into_response()
}
