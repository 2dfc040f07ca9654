//! Broker channel abstraction.
//!
//! The publisher and the listener container only talk to a [`Broker`]. Two
//! transports implement it:
//! - [`AmqpBroker`]: RabbitMQ via lapin
//! - [`MemoryBroker`]: in-process FIFO queues, for local runs and tests
//!
//! ```text
//! Publisher → Broker::publish → destination queue → Broker::subscribe → Listener
//! ```

pub mod amqp;
pub mod memory;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::options::{BasicAckOptions, BasicNackOptions};

use crate::config::{Config, Transport};
use crate::error::{DeliveryError, PublishError, SubscribeError};

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Stream of deliveries for one destination.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, DeliveryError>>;

/// Connection to a message broker.
///
/// Implementations are shared as `Arc<dyn Broker>` between the publisher and
/// the listener container, and closed once at shutdown.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue one message on `destination`, creating the destination on demand.
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), PublishError>;

    /// Start receiving messages from `destination`.
    async fn subscribe(&self, destination: &str) -> Result<DeliveryStream, SubscribeError>;

    /// Release the connection.
    async fn close(&self);
}

/// Build the broker selected by `config`. No connection is opened yet.
pub fn from_config(config: &Config) -> Arc<dyn Broker> {
    match config.transport {
        Transport::Amqp => Arc::new(AmqpBroker::new(
            config.broker_url.clone(),
            config.listener_prefetch,
            config.consumer_tag.clone(),
        )),
        Transport::Memory => Arc::new(MemoryBroker::new()),
    }
}

/// Outbound message: serialized payload plus a tracking id.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: String,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(message_id: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            body,
        }
    }
}

/// Inbound message handed to a listener.
pub struct Delivery {
    pub message_id: Option<String>,
    pub data: Vec<u8>,
    acker: Acker,
}

impl Delivery {
    pub(crate) fn new(message_id: Option<String>, data: Vec<u8>, acker: Acker) -> Self {
        Self {
            message_id,
            data,
            acker,
        }
    }

    /// Message id for logging, `"unknown"` when the publisher set none.
    pub fn message_id_or_unknown(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) -> Result<(), DeliveryError> {
        match &self.acker {
            Acker::Amqp(acker) => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| DeliveryError::Acknowledge(e.to_string())),
            Acker::Local(tally) => {
                tally.acked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Reject the delivery without requeueing it. The message is dropped.
    pub async fn reject(&self) -> Result<(), DeliveryError> {
        match &self.acker {
            Acker::Amqp(acker) => acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
                .map_err(|e| DeliveryError::Acknowledge(e.to_string())),
            Acker::Local(tally) => {
                tally.rejected.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

pub(crate) enum Acker {
    Amqp(lapin::acker::Acker),
    Local(Arc<AckTally>),
}

/// Settlement counters for in-process deliveries.
#[derive(Debug, Default)]
pub(crate) struct AckTally {
    pub(crate) acked: AtomicUsize,
    pub(crate) rejected: AtomicUsize,
}

/// Reject empty or blank destination names.
pub(crate) fn is_valid_destination(destination: &str) -> bool {
    !destination.trim().is_empty()
}
