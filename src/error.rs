//! Error taxonomy and JSON error responses for the management API and proxy.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced by the engine. Every public operation returns one of
/// these rather than a bare `anyhow::Error`, so the HTTP layer can map
/// failures to a stable status code and machine-readable code without
/// inspecting message text.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("instance not found: {name}")]
    NotFound { name: String },

    #[error("instance already exists: {name}")]
    AlreadyExists { name: String },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("conflicting operation on instance: {name}")]
    Conflict { name: String },

    #[error("maximum instance count reached ({limit})")]
    MaxInstances { limit: usize },

    #[error("maximum running instance count reached ({limit})")]
    MaxRunning { limit: usize },

    #[error("instance is not running: {name}")]
    NotRunning { name: String },

    #[error("timed out waiting for instance to become ready: {name}")]
    StartTimeout { name: String },

    #[error("instance failed to start: {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("no ports available in configured range")]
    NoPortsAvailable,

    #[error("upstream backend unavailable: {name}")]
    UpstreamUnavailable { name: String },

    #[error("persistence error: {message}")]
    PersistenceError { message: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. } => StatusCode::CONFLICT,
            Error::ValidationError { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::MaxInstances { .. } => StatusCode::CONFLICT,
            Error::MaxRunning { .. } => StatusCode::CONFLICT,
            Error::NotRunning { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::StartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::StartFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoPortsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Error::PersistenceError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::AlreadyExists { .. } => "ALREADY_EXISTS",
            Error::ValidationError { .. } => "VALIDATION_ERROR",
            Error::Conflict { .. } => "CONFLICT",
            Error::MaxInstances { .. } => "MAX_INSTANCES",
            Error::MaxRunning { .. } => "MAX_RUNNING",
            Error::NotRunning { .. } => "NOT_RUNNING",
            Error::StartTimeout { .. } => "START_TIMEOUT",
            Error::StartFailed { .. } => "START_FAILED",
            Error::NoPortsAvailable => "NO_PORTS_AVAILABLE",
            Error::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Error::PersistenceError { .. } => "PERSISTENCE_ERROR",
        }
    }

    fn to_json(&self) -> String {
        let body = ErrorBody {
            code: self.as_header_value(),
            message: self.to_string(),
            status: self.status_code().as_u16(),
        };
        serde_json::to_string(&body).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                body.code,
                body.message.replace('"', "\\\""),
                body.status
            )
        })
    }

    /// Render this error as a complete HTTP response carrying the
    /// `x-llamactl-error` header, for use at the edges of the HTTP layer.
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.status_code();
        let header = self.as_header_value();
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("x-llamactl-error", header)
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

/// Converts a persistence-layer failure into `Error::PersistenceError`.
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::PersistenceError {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            Error::NotFound { name: "a".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::MaxRunning { limit: 4 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::StartTimeout { name: "a".into() }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::UpstreamUnavailable { name: "a".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn json_body_contains_code_and_message() {
        let err = Error::NotFound {
            name: "llama-7b".into(),
        };
        let json = err.to_json();
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("llama-7b"));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn response_carries_error_header() {
        let response = Error::StartTimeout { name: "x".into() }.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("x-llamactl-error").unwrap(),
            "START_TIMEOUT"
        );
    }
}
