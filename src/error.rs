//! Crate-wide error taxonomy. Every outward-facing failure funnels through
//! [`RouterError`], which knows how to render itself as an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::store::StoreError;

/// Transport-level classification used to map a proxy failure to a status
/// code, per the substring rules in the reverse-proxy design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxUnreachableKind {
    ConnectionRefused,
    Timeout,
    Other,
}

impl SandboxUnreachableKind {
    pub fn classify(message: &str) -> Self {
        if message.contains("connection refused") {
            SandboxUnreachableKind::ConnectionRefused
        } else if message.contains("timeout") {
            SandboxUnreachableKind::Timeout
        } else {
            SandboxUnreachableKind::Other
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SandboxUnreachableKind::ConnectionRefused => StatusCode::SERVICE_UNAVAILABLE,
            SandboxUnreachableKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SandboxUnreachableKind::Other => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("session not found")]
    NotFound,

    #[error("sandbox has no matching entry point")]
    NoEntryPoint,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("server overloaded")]
    Overloaded,

    #[error("workload manager unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("workload manager protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("sandbox unreachable: {message}")]
    SandboxUnreachable {
        kind: SandboxUnreachableKind,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    pub fn sandbox_unreachable(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = SandboxUnreachableKind::classify(&message);
        RouterError::SandboxUnreachable { kind, message }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RouterError::NotFound => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            RouterError::NoEntryPoint => (StatusCode::NOT_FOUND, "NO_ENTRY_POINT"),
            RouterError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            RouterError::Overloaded => (StatusCode::TOO_MANY_REQUESTS, "SERVER_OVERLOADED"),
            RouterError::UpstreamUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
            }
            RouterError::UpstreamProtocol(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_PROTOCOL")
            }
            RouterError::SandboxUnreachable { kind, .. } => (kind.status(), "SANDBOX_UNREACHABLE"),
            RouterError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let error = self.to_string();
        if status.is_server_error() {
            tracing::error!(%error, code, "request failed");
        } else {
            tracing::debug!(%error, code, "request rejected");
        }
        (status, Json(ErrorBody { error, code })).into_response()
    }
}

impl From<StoreError> for RouterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => RouterError::NotFound,
            other => RouterError::Internal(anyhow::anyhow!(other)),
        }
    }
}
