//! Error types for the instrumentation API.
//!
//! Every variant renders as a plain-text message that starts with a fixed tag
//! (`invalid input`, `error getting resource`, `timeout`, ...) so callers can
//! classify failures without parsing JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for instrumentation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for instrumentation operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request rejected before anything was read or written
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Reading a workload or custom resource failed
    #[error("error getting resource {resource}: {reason}")]
    UpstreamRead { resource: String, reason: String },

    /// Writing the workload back failed
    #[error("error updating resource {resource}: {reason}")]
    UpstreamWrite { resource: String, reason: String },

    /// Listing custom resources failed
    #[error("error listing resources: {0}")]
    UpstreamList(String),

    /// The change subscription could not be established
    #[error("error watching resource {resource}: {reason}")]
    Watch { resource: String, reason: String },

    /// The workload was mutated but the reconciler did not confirm in time
    #[error("timeout waiting for {resource}: observed {observed} of {expected} expected change(s)")]
    ConfirmationTimeout {
        resource: String,
        expected: u8,
        observed: u8,
    },

    /// A custom resource did not have the shape the projections expect
    #[error("malformed resource document: `{path}` is not {expected}")]
    MalformedResourceDocument { path: String, expected: &'static str },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(path: impl Into<String>, expected: &'static str) -> Self {
        Error::MalformedResourceDocument {
            path: path.into(),
            expected,
        }
    }

    /// HTTP status the error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamRead { .. }
            | Error::UpstreamWrite { .. }
            | Error::UpstreamList(_)
            | Error::Watch { .. }
            | Error::ConfirmationTimeout { .. }
            | Error::MalformedResourceDocument { .. }
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures that happen after the workload was already mutated
    pub fn mutation_applied(&self) -> bool {
        matches!(self, Error::ConfirmationTimeout { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_start_with_fixed_tags() {
        let read = Error::UpstreamRead {
            resource: "deployment ns1/svcA".to_string(),
            reason: "not found".to_string(),
        };
        assert!(read.to_string().starts_with("error getting resource"));

        let write = Error::UpstreamWrite {
            resource: "deployment ns1/svcA".to_string(),
            reason: "conflict".to_string(),
        };
        assert!(write.to_string().starts_with("error updating resource"));

        let timeout = Error::ConfirmationTimeout {
            resource: "deployment ns1/svcA".to_string(),
            expected: 3,
            observed: 1,
        };
        assert!(timeout.to_string().starts_with("timeout"));
        assert!(timeout.to_string().contains("observed 1 of 3"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::InvalidInput("kind".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::malformed("spec.languages", "an array").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::UpstreamList("forbidden".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_timeout_keeps_mutation() {
        let timeout = Error::ConfirmationTimeout {
            resource: "statefulset ns/db".to_string(),
            expected: 2,
            observed: 0,
        };
        assert!(timeout.mutation_applied());
        assert!(!Error::InvalidInput("x".into()).mutation_applied());
    }
}
