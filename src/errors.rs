//! Crate-wide error taxonomy (§7) and its HTTP rendering.
//!
//! `GatewayError` is the single error type propagated out of the tracking
//! store, precache manager and remote-store client. The HTTP layer converts
//! it into the standard JSON error body; `InProgress` is deliberately not a
//! variant here — it is carried as an `Ok` value by the handlers so it is
//! never mistaken for a genuine failure (see Design Note "Coroutine control
//! flow").

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("not acceptable")]
    NotAcceptable,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("precache full")]
    PrecacheFull,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("request timed out")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::PrecacheFull => StatusCode::INSUFFICIENT_STORAGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "Bad Request",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::Forbidden(_) => "Forbidden",
            GatewayError::NotFound(_) => "Not Found",
            GatewayError::MethodNotAllowed { .. } => "Method Not Allowed",
            GatewayError::NotAcceptable => "Not Acceptable",
            GatewayError::Conflict(_) => "Conflict",
            GatewayError::RangeNotSatisfiable { .. } => "Range Not Satisfiable",
            GatewayError::PrecacheFull => "Precache Full",
            GatewayError::Internal(_) => "Internal Server Error",
            GatewayError::Timeout => "Request Timeout",
            GatewayError::UpstreamUnavailable(_) => "Upstream Unavailable",
            GatewayError::UpstreamTimeout => "Upstream Timeout",
        }
    }
}

/// The JSON document every non-success response carries (§6/§7).
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub reason: String,
    pub description: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status: status.as_u16(),
            reason: self.reason().to_string(),
            description: self.to_string(),
        };

        tracing::warn!(status = %status.as_u16(), description = %body.description, "request failed");

        let mut response = (status, Json(body)).into_response();

        if let GatewayError::RangeNotSatisfiable { size } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert("Content-Range", value);
            }
        }

        if let GatewayError::Unauthorized(challenge) = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(challenge) {
                response.headers_mut().insert("WWW-Authenticate", value);
            }
        }

        if let GatewayError::MethodNotAllowed { allow } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(allow) {
                response.headers_mut().insert("Allow", value);
            }
        }

        response
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Internal(format!("tracking store error: {e}"))
    }
}

impl From<crate::tracking::TrackingError> for GatewayError {
    fn from(e: crate::tracking::TrackingError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Internal(format!("I/O error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
