//! Error types for the dispatch engine.
//!
//! Mirrors the classification scheme the rest of this codebase uses for
//! background workers: an error carries a `category()` that drives whether
//! (and how long) to retry, independent of how it's rendered to a caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("queue is full")]
    QueueFull,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job cannot be cancelled in its current state")]
    NotCancellable,

    #[error("no eligible extension for job")]
    NoEligibleExtension,

    #[error("extension worker reported a retryable failure: {0}")]
    WorkerTransient(String),

    #[error("extension worker reported a terminal failure: {0}")]
    WorkerTerminal(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("rate limited, retry after backoff")]
    RateLimited,

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::NotCancellable => {
                ErrorCategory::Permanent
            }
            Self::QueueFull | Self::RateLimited => ErrorCategory::RateLimited,
            Self::NoEligibleExtension => ErrorCategory::Routing,
            Self::WorkerTransient(_) => ErrorCategory::Transient,
            Self::WorkerTerminal(_) => ErrorCategory::Permanent,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Internal(_) => ErrorCategory::Internal,
            Self::Serialization(_) => ErrorCategory::Permanent,
        }
    }
}

/// Classification driving retry/DLQ disposition, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retries with backoff up to the DLQ threshold, then DLQ.
    Transient,
    /// DLQ immediately, last error preserved.
    Permanent,
    /// Requeue as pending-waiting; no attempt counter increment.
    Routing,
    /// Caller should back off and retry the admission request itself.
    RateLimited,
    /// Reply with an error frame; session's in-flight work is failed over.
    Protocol,
    /// Engine fails fast for this job only; rest of the system stays up.
    Internal,
}

impl ErrorCategory {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transient | Self::Routing)
    }

    /// Whether retrying this error increments the job's attempt counter.
    /// Routing failures are explicitly not the job's fault (spec §7).
    pub fn counts_as_attempt(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// The `{code, error, message, details}` envelope every HTTP route returns
/// on failure.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub error: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotCancellable => StatusCode::CONFLICT,
            Self::NoEligibleExtension => StatusCode::SERVICE_UNAVAILABLE,
            Self::WorkerTransient(_) => StatusCode::BAD_GATEWAY,
            Self::WorkerTerminal(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::QueueFull => "QUEUE_FULL",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotCancellable => "NOT_CANCELLABLE",
            Self::NoEligibleExtension => "NO_ELIGIBLE_EXTENSION",
            Self::WorkerTransient(_) => "WORKER_TRANSIENT",
            Self::WorkerTerminal(_) => "WORKER_TERMINAL",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Numeric code, grouped in hundreds by category: 1xxx client-caused,
    /// 2xxx routing/admission, 5xxx internal.
    fn numeric_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1000,
            Self::NotFound(_) => 1001,
            Self::NotCancellable => 1002,
            Self::Protocol(_) => 1003,
            Self::Serialization(_) => 1004,
            Self::QueueFull => 2000,
            Self::NoEligibleExtension => 2001,
            Self::RateLimited => 2002,
            Self::WorkerTransient(_) => 2100,
            Self::WorkerTerminal(_) => 2101,
            Self::Internal(_) => 5000,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = ErrorBody {
            code: self.numeric_code(),
            error: self.error_code(),
            message: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_transient_retries_and_counts_as_attempt() {
        let err = EngineError::WorkerTransient("timeout".into());
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.category().should_retry());
        assert!(err.category().counts_as_attempt());
    }

    #[test]
    fn routing_failure_retries_without_counting_as_attempt() {
        let err = EngineError::NoEligibleExtension;
        assert_eq!(err.category(), ErrorCategory::Routing);
        assert!(err.category().should_retry());
        assert!(!err.category().counts_as_attempt());
    }

    #[test]
    fn worker_terminal_is_permanent() {
        let err = EngineError::WorkerTerminal("unauthorized".into());
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.category().should_retry());
    }

    #[test]
    fn validation_is_permanent_no_queue_mutation() {
        let err = EngineError::Validation("bad url".into());
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn into_response_maps_queue_full_to_service_unavailable() {
        let response = EngineError::QueueFull.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn into_response_maps_not_found_to_404() {
        let response = EngineError::NotFound("job-1".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
