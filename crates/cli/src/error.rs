//! Error types for CLI operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Simulation parameters that cannot produce a stream
    #[error("Invalid simulation settings: {message}")]
    Simulation { message: String },

    /// A simulated stream would not be picked up by the configured query
    #[error("Simulated stream '{stream}' does not match query \"{query}\"")]
    QueryMismatch { stream: String, query: String },
}

impl CliError {
    pub fn config_not_found(path: &std::path::Path) -> Self {
        Self::ConfigNotFound {
            path: path.display().to_string(),
        }
    }

    pub fn simulation(message: impl Into<String>) -> Self {
        Self::Simulation {
            message: message.into(),
        }
    }

    pub fn query_mismatch(stream: impl Into<String>, query: impl Into<String>) -> Self {
        Self::QueryMismatch {
            stream: stream.into(),
            query: query.into(),
        }
    }
}
