//! Layered error definitions
//!
//! Categorized by how a caller is expected to react:
//! steady-state network conditions (timeout / lost), caller defects
//! (argument), protocol corruption (internal) and configuration.

use thiserror::Error;

/// Unified error type for the streaming layer
#[derive(Debug, Error)]
pub enum StreamError {
    // ===== Steady-State Network Conditions =====
    /// Operation deadline elapsed with no definitive answer
    #[error("timeout after {waited_ms}ms: {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    /// Source confirmed unreachable, or restarted without a recoverable source id
    #[error("stream lost: {stream}")]
    Lost { stream: String },

    // ===== Caller Defects =====
    /// Caller contract violation (channel-count mismatch, empty name, ...)
    #[error("invalid argument: {message}")]
    Argument { message: String },

    // ===== Protocol Errors =====
    /// Protocol-level corruption, not recoverable by the caller
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Wire codec error
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Create timeout error
    pub fn timeout(operation: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create lost-stream error
    pub fn lost(stream: impl Into<String>) -> Self {
        Self::Lost {
            stream: stream.into(),
        }
    }

    /// Create argument error
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Timeout and lost are expected conditions of network code; callers
    /// polling in a loop should catch them per call and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Lost { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost { .. })
    }
}

/// Result alias for the streaming layer
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recoverable_classification() {
        assert!(StreamError::timeout("pull", Duration::from_millis(5)).is_recoverable());
        assert!(StreamError::lost("eeg").is_recoverable());
        assert!(!StreamError::argument("bad").is_recoverable());
        assert!(!StreamError::internal("corrupt").is_recoverable());
    }

    #[test]
    fn test_timeout_message() {
        let err = StreamError::timeout("open_stream", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timeout after 1500ms: open_stream");
    }
}
