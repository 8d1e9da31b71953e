//! Relay error types.

use broker_client::BrokerError;
use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Broker connection or operation error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection's outbound queue is full or closed.
    #[error("Channel send error")]
    ChannelSend,
}

impl From<tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>) -> Self {
        RelayError::ChannelSend
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
