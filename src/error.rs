//! # Error Handling
//!
//! This module defines the two error layers used by the evaluator:
//!
//! - **EvaluationError**: the domain taxonomy of the live pipeline (upstream failures,
//!   missing or duplicate sessions, persistence problems). Most of these are recovered
//!   locally by the pipeline and never reach a client.
//! - **AppError**: what HTTP handlers return. It knows how to turn itself into a JSON
//!   response with the right status code.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### thiserror
//! - **#[derive(Error)]**: Generates the `Display` and `std::error::Error` impls
//! - **#[error("...")]**: The message template for each variant
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (used by `?`)
//! - **ResponseError trait**: Converts errors to HTTP responses

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;

/// Failure kinds of the live evaluation pipeline.
///
/// ## Recovery Policy:
/// - **TransientUpstreamFailure / MalformedUpstreamResponse**: recovered locally by
///   substituting a default or sentinel value; never aborts a session
/// - **SessionNotFound / DuplicateSession / CapacityExceeded**: surfaced to the caller
///   of the session-scoped operation
/// - **PersistenceFailure**: surfaced and logged, in-memory state is kept
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// A transcription or analysis call failed or timed out
    #[error("Upstream service failure: {0}")]
    TransientUpstreamFailure(String),

    /// An upstream call returned something we could not parse
    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists for connection: {0}")]
    DuplicateSession(String),

    #[error("Maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    /// A lifecycle transition that would move a session backwards
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The session no longer accepts audio (ending or completed)
    #[error("Session {0} is not accepting audio")]
    NotAcceptingAudio(String),

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

impl EvaluationError {
    /// True for failures the pipeline recovers from by substituting defaults.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EvaluationError::TransientUpstreamFailure(_)
                | EvaluationError::MalformedUpstreamResponse(_)
        )
    }

    /// Short machine-readable kind, used in `error` events sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::TransientUpstreamFailure(_) => "transient_upstream_failure",
            EvaluationError::MalformedUpstreamResponse(_) => "malformed_upstream_response",
            EvaluationError::SessionNotFound(_) => "session_not_found",
            EvaluationError::DuplicateSession(_) => "duplicate_session",
            EvaluationError::CapacityExceeded(_) => "capacity_exceeded",
            EvaluationError::InvalidTransition { .. } => "invalid_transition",
            EvaluationError::NotAcceptingAudio(_) => "not_accepting_audio",
            EvaluationError::InvalidAudio(_) => "invalid_audio",
            EvaluationError::PersistenceFailure(_) => "persistence_failure",
        }
    }
}

/// Shorthand for pipeline results.
pub type EvalResult<T> = Result<T, EvaluationError>;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **Conflict**: Resource already exists or capacity is exhausted (409 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (storage failures, upstream outages, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Request conflicts with current server state
    Conflict(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    /// Map each variant to its HTTP status and machine-readable type.
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

/// Converts our errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session not found: 4f1c...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Pipeline errors reaching an HTTP handler keep their meaning:
/// missing sessions become 404, conflicts 409, persistence problems 500.
impl From<EvaluationError> for AppError {
    fn from(err: EvaluationError) -> Self {
        let message = err.to_string();
        match err {
            EvaluationError::SessionNotFound(_) => AppError::NotFound(message),
            EvaluationError::DuplicateSession(_) | EvaluationError::CapacityExceeded(_) => {
                AppError::Conflict(message)
            }
            EvaluationError::InvalidAudio(_)
            | EvaluationError::InvalidTransition { .. }
            | EvaluationError::NotAcceptingAudio(_) => AppError::BadRequest(message),
            EvaluationError::TransientUpstreamFailure(_)
            | EvaluationError::MalformedUpstreamResponse(_)
            | EvaluationError::PersistenceFailure(_) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_upstream_failures_are_recoverable() {
        assert!(EvaluationError::TransientUpstreamFailure("timeout".into()).is_recoverable());
        assert!(EvaluationError::MalformedUpstreamResponse("no json".into()).is_recoverable());
        assert!(!EvaluationError::SessionNotFound("abc".into()).is_recoverable());
        assert!(!EvaluationError::PersistenceFailure("disk full".into()).is_recoverable());
    }

    #[test]
    fn test_evaluation_error_maps_to_http_status() {
        let not_found: AppError = EvaluationError::SessionNotFound("abc".into()).into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let duplicate: AppError = EvaluationError::DuplicateSession("conn-1".into()).into();
        assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);

        let persistence: AppError = EvaluationError::PersistenceFailure("io".into()).into();
        assert_eq!(persistence.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_display_messages() {
        let err = EvaluationError::CapacityExceeded(10);
        assert_eq!(err.to_string(), "Maximum concurrent sessions (10) reached");
        assert_eq!(err.kind(), "capacity_exceeded");

        let app = AppError::Conflict("taken".into());
        assert_eq!(app.to_string(), "Conflict: taken");
    }
}
