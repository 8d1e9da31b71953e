//! Broker error types.

use thiserror::Error;

/// Broker client error type.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// NATS connection, publish or unsubscribe error.
    #[error("NATS error: {0}")]
    Nats(#[from] async_nats::Error),

    /// NATS subscription error.
    #[error("NATS subscription error: {0}")]
    NatsSubscribe(#[from] async_nats::SubscribeError),

    /// The channel name cannot be used with this backend.
    #[error("Invalid channel '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// The broker URL scheme is not recognized.
    #[error("Unsupported broker URL: {0}")]
    UnsupportedUrl(String),

    /// The broker refused the operation.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The delivery task of a subscription panicked or was cancelled.
    #[error("Subscription task failed: {0}")]
    TaskFailed(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
