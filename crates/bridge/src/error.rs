//! Bridge error types

use contracts::StreamError;
use thiserror::Error;

/// Bridge-specific errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Stream endpoint failure that cannot be absorbed by the tick loop
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Selected channel does not exist on the bound stream
    #[error("stream '{stream}' has {channels} channels, channel {channel} was selected")]
    ChannelOutOfRange {
        stream: String,
        channel: usize,
        channels: usize,
    },

    /// Unusable bridge configuration
    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
