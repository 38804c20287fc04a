use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Request-path errors of the proxy. Each variant maps to one HTTP status;
/// messages are one-line plain ASCII carrying no identifiers beyond the
/// service name.
#[derive(Error, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProxyError {
    /// No service row with the requested name.
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    /// The service exists but is disabled or soft-deleted.
    #[error("service disabled: {0}")]
    ServiceDisabled(String),
    /// Missing or invalid credentials.
    #[error("authentication required")]
    Unauthorized,
    /// Per-user daily request cap reached.
    #[error("daily request limit reached for service {0}")]
    RateLimited(String),
    /// The action segment selects no known direction.
    #[error("unknown proxy action: {0}")]
    BadAction(String),
    /// The backend instance could not be started.
    #[error("service {service} failed to start: {detail}")]
    StartupFailed { service: String, detail: String },
    /// The upstream connection was lost mid-request.
    #[error("service {0} upstream unreachable")]
    TransportFailed(String),
    /// Anything else; not expected on the happy path.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::ServiceDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::BadAction(_) => StatusCode::BAD_REQUEST,
            ProxyError::StartupFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::TransportFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::ServiceNotFound(_) => "service_not_found",
            ProxyError::ServiceDisabled(_) => "service_disabled",
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::RateLimited(_) => "rate_limited",
            ProxyError::BadAction(_) => "bad_action",
            ProxyError::StartupFailed { .. } => "startup_failed",
            ProxyError::TransportFailed(_) => "transport_failed",
            ProxyError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            log::error!("Proxy error ({}): {}", self.kind(), message);
        } else {
            log::warn!("Proxy error ({}): {}", self.kind(), message);
        }
        let body = json!({ "error": { "kind": self.kind(), "message": message } });
        (status, Json(body)).into_response()
    }
}

impl From<crate::db::StoreError> for ProxyError {
    fn from(err: crate::db::StoreError) -> Self {
        match err {
            crate::db::StoreError::NotFound(msg) => ProxyError::ServiceNotFound(msg),
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
