//! Error types for the supervisor and JSON error responses for the listeners

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by a [`ServerInstance`](crate::instance::ServerInstance)
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed alias path, alias URL or constructor argument
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation requires a running target instance
    #[error("server {0} must be alive before creating an alias")]
    Precondition(String),

    /// One of the enabled listeners failed to bind
    #[error("unable to start the server {name}: {cause}")]
    Startup {
        name: String,
        #[source]
        cause: ServeError,
    },
}

impl ServerError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServerError::Validation(message.into())
    }

    pub fn is_startup(&self) -> bool {
        matches!(self, ServerError::Startup { .. })
    }
}

/// Errors reported by a listener through its event channel
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("listener closed before it started listening")]
    Closed,
}

/// Error codes for responses produced by a listener itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServeErrorCode {
    /// Request path is not valid percent-encoded UTF-8
    BadRequest,
    /// No file under the served directory
    NotFound,
    /// Path escapes the served directory
    Forbidden,
    /// Static files only answer GET and HEAD
    MethodNotAllowed,
    /// Rewrite target could not be reached
    UpstreamFailed,
    /// Rewrite produced an unusable target URL
    BadRewrite,
    /// Internal listener error
    InternalError,
}

impl ServeErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ServeErrorCode::NotFound => StatusCode::NOT_FOUND,
            ServeErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ServeErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServeErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ServeErrorCode::BadRewrite => StatusCode::INTERNAL_SERVER_ERROR,
            ServeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Server-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ServeErrorCode::BadRequest => "BAD_REQUEST",
            ServeErrorCode::NotFound => "NOT_FOUND",
            ServeErrorCode::Forbidden => "FORBIDDEN",
            ServeErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ServeErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ServeErrorCode::BadRewrite => "BAD_REWRITE",
            ServeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ServeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ServeErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Server-Error header
pub fn json_error_response(
    code: ServeErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Server-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
