use thiserror::Error;

/// Errors raised by a message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connecting to the broker or opening a channel failed.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// Declaring an exchange, queue or binding failed.
    #[error("Failed to declare {name}: {reason}")]
    Declare { name: String, reason: String },

    /// Publishing a message failed.
    #[error("Failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },

    /// Starting or continuing a consumer failed.
    #[error("Failed to consume from queue {queue}: {reason}")]
    Consume { queue: String, reason: String },

    /// The broker has been shut down.
    #[error("Broker is closed")]
    Closed,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
