//! Error types for callables

use thiserror::Error;

use crate::status::{Code, Status};

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, CallError>;

/// A transport failure annotated with whether it is worth retrying.
///
/// Produced by the exception-transforming layer; the retry engine only ever
/// retries errors of this shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}")]
pub struct ApiError {
    status: Status,
    retryable: bool,
}

impl ApiError {
    pub fn new(status: Status, retryable: bool) -> Self {
        Self { status, retryable }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn code(&self) -> Code {
        self.status.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Main error type for callables
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Raw failure from the leaf call
    #[error("transport error: {0}")]
    Transport(#[from] Status),

    /// Classified failure
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// The total retry budget elapsed before any attempt succeeded
    #[error("{}", deadline_message(.last))]
    DeadlineExceeded { last: Option<ApiError> },

    /// Bundle-level failure that did not come from the upstream call
    #[error("bundling error: {0}")]
    Bundling(String),

    /// The bundler factory was closed before the request could be enqueued
    #[error("bundler closed")]
    BundlerClosed,

    /// The result sink was dropped before it was resolved
    #[error("call cancelled before completion")]
    Cancelled,

    /// Invalid settings
    #[error("configuration error: {0}")]
    Config(String),
}

fn deadline_message(last: &Option<ApiError>) -> String {
    match last {
        Some(err) => format!("total deadline exceeded, last error: {err}"),
        None => "total deadline exceeded without completing any call".to_string(),
    }
}

impl CallError {
    /// The status code carried by this error, if it has one.
    pub fn code(&self) -> Option<Code> {
        match self {
            CallError::Transport(status) => Some(status.code()),
            CallError::Api(err) => Some(err.code()),
            CallError::DeadlineExceeded { .. } => Some(Code::DeadlineExceeded),
            CallError::Cancelled => Some(Code::Cancelled),
            _ => None,
        }
    }

    /// True only for classified errors flagged as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Api(err) if err.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CallError::Api(ApiError::new(Status::failed_precondition("foobar"), false));
        assert_eq!(err.to_string(), "api error: FAILED_PRECONDITION: foobar");

        let err = CallError::DeadlineExceeded { last: None };
        assert_eq!(
            err.to_string(),
            "total deadline exceeded without completing any call"
        );
    }

    #[test]
    fn deadline_error_surfaces_last_cause() {
        let last = ApiError::new(Status::unavailable("foobar"), true);
        let err = CallError::DeadlineExceeded { last: Some(last) };
        assert!(err.to_string().contains("foobar"));
        assert_eq!(err.code(), Some(Code::DeadlineExceeded));
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_flagged_api_errors_are_retryable() {
        assert!(CallError::from(ApiError::new(Status::unavailable("x"), true)).is_retryable());
        assert!(!CallError::from(ApiError::new(Status::unavailable("x"), false)).is_retryable());
        assert!(!CallError::from(Status::unavailable("x")).is_retryable());
    }
}
