//! Messaging error types.

use thiserror::Error;

/// Errors raised by the messaging layer.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Could not reach or set up the broker.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// No live session; the connection is down or was closed.
    #[error("Broker connection is not available")]
    NotConnected,

    /// The connection was explicitly closed.
    #[error("Broker connection is closed")]
    Closed,

    #[error("Routing key is required")]
    MissingRoutingKey,

    #[error("Queue name is required for consuming")]
    MissingQueueName,

    #[error("Publish failed: {0}")]
    Publish(String),

    /// The broker refused the message.
    #[error("Message was not acknowledged by the broker")]
    NotConfirmed,

    #[error("Timed out waiting for publisher confirmation")]
    ConfirmTimeout,

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;
