//! RabbitMQ broker using lapin.
//!
//! Keeps one persistent connection plus a publishing channel, reconnecting
//! when the channel drops. Each subscription gets its own channel with QoS
//! applied, so a slow listener never stalls publisher confirms.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::{is_valid_destination, Acker, Broker, Delivery, DeliveryStream, Envelope};
use crate::error::{DeliveryError, PublishError, SubscribeError};
use crate::queue::CONTENT_TYPE_JSON;

/// Async RabbitMQ broker with connection management.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    prefetch: u16,
    consumer_tag: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    consumer_channels: Mutex<Vec<Channel>>,
    declared: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl AmqpBroker {
    /// Create a broker for the given RabbitMQ URL. No connection is opened
    /// until the first publish or subscribe.
    pub fn new(url: String, prefetch: u16, consumer_tag: String) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                prefetch,
                consumer_tag,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                consumer_channels: Mutex::new(Vec::new()),
                declared: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Ensure we have a valid connection and publishing channel.
    async fn ensure_connected(&self) -> Result<Channel, lapin::Error> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!(url_length = self.inner.url.len(), "rabbitmq_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default()).await?;

        info!("rabbitmq_connected");

        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;

        // Queues declared on the old connection must be declared again.
        self.inner.declared.lock().await.clear();

        if let Some(old) = connection.replace(conn) {
            if let Err(e) = old.close(200, "Reconnecting").await {
                warn!(error = %e, "rabbitmq_stale_connection_close_error");
            }
        }

        let pruned = retain_live(&mut *self.inner.consumer_channels.lock().await, |c| {
            c.status().connected()
        });
        if pruned > 0 {
            info!(pruned = pruned, "rabbitmq_stale_consumer_channels_pruned");
        }

        *channel = Some(ch.clone());

        info!("rabbitmq_publisher_confirms_enabled");

        Ok(ch)
    }

    /// Open a dedicated channel on the shared connection.
    async fn open_channel(&self) -> Result<Channel, SubscribeError> {
        let unavailable = |e: lapin::Error| SubscribeError::ConnectionUnavailable(e.to_string());

        self.ensure_connected().await.map_err(unavailable)?;

        let connection = self.inner.connection.read().await;
        match connection.as_ref() {
            Some(conn) => conn.create_channel().await.map_err(unavailable),
            None => Err(SubscribeError::ConnectionUnavailable(
                "connection closed".to_string(),
            )),
        }
    }

    /// Declare a durable queue once per connection (creation on demand).
    async fn declare(&self, channel: &Channel, destination: &str) -> Result<(), lapin::Error> {
        let mut declared = self.inner.declared.lock().await;
        if declared.contains(destination) {
            return Ok(());
        }

        channel
            .queue_declare(
                destination,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %destination, "rabbitmq_queue_declared");
        declared.insert(destination.to_string());
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), PublishError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PublishError::ConnectionUnavailable(
                "broker closed".to_string(),
            ));
        }
        if !is_valid_destination(destination) {
            return Err(PublishError::InvalidDestination);
        }

        let channel = self
            .ensure_connected()
            .await
            .map_err(|e| PublishError::ConnectionUnavailable(e.to_string()))?;

        self.declare(&channel, destination)
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        let confirmation = channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                &envelope.body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type(CONTENT_TYPE_JSON.into())
                    .with_message_id(envelope.message_id.clone().into()),
            )
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        check_confirmation(confirmation)?;

        info!(
            queue = %destination,
            message_id = %envelope.message_id,
            body_length = envelope.body.len(),
            "rabbitmq_message_published"
        );

        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<DeliveryStream, SubscribeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SubscribeError::ConnectionUnavailable(
                "broker closed".to_string(),
            ));
        }
        if !is_valid_destination(destination) {
            return Err(SubscribeError::InvalidDestination);
        }

        let unavailable = |e: lapin::Error| SubscribeError::ConnectionUnavailable(e.to_string());

        let channel = self.open_channel().await?;

        channel
            .basic_qos(self.inner.prefetch, BasicQosOptions::default())
            .await
            .map_err(unavailable)?;

        info!(prefetch_count = self.inner.prefetch, "rabbitmq_qos_set");

        self.declare(&channel, destination)
            .await
            .map_err(unavailable)?;

        let consumer = channel
            .basic_consume(
                destination,
                &self.inner.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        info!(
            queue = %destination,
            consumer_tag = %self.inner.consumer_tag,
            "rabbitmq_consumer_started"
        );

        {
            let mut channels = self.inner.consumer_channels.lock().await;
            retain_live(&mut *channels, |c| c.status().connected());
            channels.push(channel);
        }

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => {
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|s| s.to_string());
                Ok(Delivery::new(message_id, delivery.data, Acker::Amqp(delivery.acker)))
            }
            Err(e) => Err(DeliveryError::Transport(e.to_string())),
        });

        Ok(stream.boxed())
    }

    /// Close the connection gracefully.
    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        for ch in self.inner.consumer_channels.lock().await.drain(..) {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_consumer_channel_close_error");
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        self.inner.declared.lock().await.clear();

        info!("rabbitmq_broker_closed");
    }
}

/// Map a publisher confirm onto the publish result. Confirms are always
/// enabled on the publishing channel, so `NotRequested` is a failure too.
fn check_confirmation(confirmation: Confirmation) -> Result<(), PublishError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(PublishError::Broker(
            "broker nacked the message".to_string(),
        )),
        Confirmation::NotRequested => Err(PublishError::Broker(
            "publisher confirm not requested".to_string(),
        )),
    }
}

/// Keep only entries `is_live` accepts; returns how many were dropped.
fn retain_live<T>(items: &mut Vec<T>, is_live: impl Fn(&T) -> bool) -> usize {
    let before = items.len();
    items.retain(|item| is_live(item));
    before - items.len()
}
