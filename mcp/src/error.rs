//! Batch error types.
//!
//! The first four variants abort a batch before any operation is dispatched.
//! The `Remote*` variants are recorded per operation and never escape the
//! scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    RemoteTimeout { tool: String, timeout_ms: u64 },

    #[error("{0}")]
    RemoteApplicationError(String),

    #[error("Transport error: {0}")]
    RemoteTransportError(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Machine-readable classification of an [`McpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ConfigurationInvalid,
    CommandNotFound,
    ValidationFailed,
    ConnectionFailed,
    RemoteTimeout,
    RemoteApplicationError,
    RemoteTransportError,
    InvalidArguments,
    Io,
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::ConfigurationInvalid(_) => ErrorKind::ConfigurationInvalid,
            McpError::CommandNotFound(_) => ErrorKind::CommandNotFound,
            McpError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            McpError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            McpError::RemoteTimeout { .. } => ErrorKind::RemoteTimeout,
            McpError::RemoteApplicationError(_) => ErrorKind::RemoteApplicationError,
            McpError::RemoteTransportError(_) => ErrorKind::RemoteTransportError,
            McpError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            McpError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error aborts the whole batch before dispatch.
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(
            self,
            McpError::ConfigurationInvalid(_)
                | McpError::CommandNotFound(_)
                | McpError::ValidationFailed(_)
                | McpError::ConnectionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(McpError::ConfigurationInvalid("x".into()).is_fatal_to_batch());
        assert!(McpError::CommandNotFound("x".into()).is_fatal_to_batch());
        assert!(McpError::ValidationFailed("x".into()).is_fatal_to_batch());
        assert!(McpError::ConnectionFailed("x".into()).is_fatal_to_batch());

        let timeout = McpError::RemoteTimeout {
            tool: "read_file".into(),
            timeout_ms: 10,
        };
        assert!(!timeout.is_fatal_to_batch());
        assert!(!McpError::RemoteApplicationError("x".into()).is_fatal_to_batch());
        assert!(!McpError::RemoteTransportError("x".into()).is_fatal_to_batch());
    }

    #[test]
    fn test_error_kind_serializes_camel_case() {
        let kind = McpError::RemoteTimeout {
            tool: "t".into(),
            timeout_ms: 1,
        }
        .kind();
        assert_eq!(serde_json::to_value(kind).unwrap(), "remoteTimeout");
    }

    #[test]
    fn test_application_error_displays_bare_message() {
        let err = McpError::RemoteApplicationError("disk full".into());
        assert_eq!(err.to_string(), "disk full");
    }
}
