//! Error types for edu-events

use thiserror::Error;

/// Errors that can occur in the subscription and delivery layer
#[derive(Debug, Error)]
pub enum EventError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker connection is down; nothing can be published
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Publish failure
    #[error("Failed to publish message to subject '{subject}': {reason}")]
    Publish {
        subject: String,
        reason: String,
    },

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe {
        subject: String,
        reason: String,
    },

    /// A consumer cannot be bound as declared
    ///
    /// Raised when the bound stream does not cover the subject filter, or
    /// when the durable name is already taken by a differently-configured
    /// consumer.
    #[error("Failed to bind consumer '{durable}': {reason}")]
    Binding {
        durable: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Metrics registration or encoding failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// No tenant identity is available for a tenant-scoped operation
    #[error("Missing tenant resource path")]
    MissingTenant,

    /// The bus is shutting down and no longer accepts work
    #[error("Event bus is shut down")]
    Shutdown,
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;
