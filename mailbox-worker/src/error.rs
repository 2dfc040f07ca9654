//! Error types for publishing, subscribing and delivery.
//!
//! Each failure is terminal for the single operation it affects. Nothing in
//! this crate retries, dead-letters or circuit-breaks.

use thiserror::Error;

/// Failure to hand a message to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("destination name must not be empty")]
    InvalidDestination,

    #[error("broker connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker rejected publish: {0}")]
    Broker(String),
}

/// Failure to consume a single delivered message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("failed to acknowledge delivery: {0}")]
    Acknowledge(String),

    #[error("transport error while receiving: {0}")]
    Transport(String),
}

/// Failure to register or attach a listener.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("destination name must not be empty")]
    InvalidDestination,

    #[error("a listener is already registered for destination {0}")]
    DuplicateListener(String),

    #[error("destination {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("broker connection unavailable: {0}")]
    ConnectionUnavailable(String),
}
