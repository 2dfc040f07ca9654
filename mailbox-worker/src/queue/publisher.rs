//! Email publisher.
//!
//! Wraps a shared [`Broker`] and turns an [`Email`] into an [`Envelope`] on a
//! named destination. Cheap to clone; clones share the broker and the
//! message id sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use super::codec::encode_email;
use super::types::Email;
use crate::broker::{is_valid_destination, Broker, Envelope};
use crate::error::PublishError;

/// Publishes emails to a destination through an injected broker.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    sequence: Arc<AtomicU64>,
}

impl Publisher {
    /// Create a new publisher over the given broker connection.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serialize `email` and enqueue it on `destination`.
    ///
    /// Returns once the broker has accepted the message. Failures are handed
    /// back to the caller unchanged; nothing is retried.
    pub async fn send(&self, destination: &str, email: &Email) -> Result<(), PublishError> {
        if !is_valid_destination(destination) {
            return Err(PublishError::InvalidDestination);
        }

        let body = encode_email(email)?;

        // Generate a message ID for tracking
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = format!("{}-{}", destination, sequence);
        let body_length = body.len();

        if let Err(e) = self
            .broker
            .publish(destination, Envelope::new(message_id.clone(), body))
            .await
        {
            error!(
                destination = %destination,
                message_id = %message_id,
                error = %e,
                "mailbox_publish_failed"
            );
            return Err(e);
        }

        info!(
            destination = %destination,
            message_id = %message_id,
            to = %email.to(),
            body_length = body_length,
            "mailbox_message_published"
        );

        Ok(())
    }
}
