//! Error taxonomy and JSON error responses for the hub

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by hub operations.
///
/// Lower layers (database, process launching, Docker) report `anyhow::Error`
/// which lands in [`HubError::Internal`]; its details are logged but never
/// sent to clients.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Bad credentials or insufficient permissions
    #[error("{0}")]
    AuthFailure(String),
    /// Malformed JSON or bad field types
    #[error("{0}")]
    InvalidInput(String),
    /// Duplicate create, spawn while running, stop while not running
    #[error("{0}")]
    Conflict(String),
    /// A local-account backend has no system account for this user
    #[error("User {0} does not exist on the system")]
    UnknownUser(String),
    /// Unknown user, token or route
    #[error("{0}")]
    NotFound(String),
    /// A spawn, stop or readiness deadline elapsed
    #[error("{0}")]
    Timeout(String),
    /// A backend process, the proxy or a remote service failed
    #[error("{0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type HubResult<T> = Result<T, HubError>;

/// One operation outcome may be reported to several waiting requests
impl Clone for HubError {
    fn clone(&self) -> Self {
        match self {
            HubError::AuthFailure(m) => HubError::AuthFailure(m.clone()),
            HubError::InvalidInput(m) => HubError::InvalidInput(m.clone()),
            HubError::Conflict(m) => HubError::Conflict(m.clone()),
            HubError::UnknownUser(m) => HubError::UnknownUser(m.clone()),
            HubError::NotFound(m) => HubError::NotFound(m.clone()),
            HubError::Timeout(m) => HubError::Timeout(m.clone()),
            HubError::Upstream(m) => HubError::Upstream(m.clone()),
            HubError::Internal(e) => HubError::Internal(anyhow::anyhow!("{:#}", e)),
        }
    }
}

impl HubError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::AuthFailure(_) => StatusCode::FORBIDDEN,
            HubError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            HubError::Conflict(_) => StatusCode::BAD_REQUEST,
            HubError::UnknownUser(_) => StatusCode::BAD_REQUEST,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HubError::Upstream(_) => StatusCode::BAD_GATEWAY,
            HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::AuthFailure(_) => "auth_failure",
            HubError::InvalidInput(_) => "invalid_input",
            HubError::Conflict(_) => "conflict",
            HubError::UnknownUser(_) => "unknown_user",
            HubError::NotFound(_) => "not_found",
            HubError::Timeout(_) => "timeout",
            HubError::Upstream(_) => "upstream_failure",
            HubError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a client
    pub fn public_message(&self) -> String {
        match self {
            HubError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_response(&self) -> Response<Full<Bytes>> {
        json_error_response(self.status_code(), self.public_message())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,
    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"status":{},"message":"{}"}}"#,
                self.status,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a `{status, message}` JSON error response
pub fn json_error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(status, message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
