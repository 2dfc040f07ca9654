//! In-process broker backed by one unbounded FIFO queue per destination.
//!
//! Destinations are created on demand by either side. Messages published
//! before a subscriber attaches stay buffered until it does. Each destination
//! accepts a single subscriber at a time; dropping a subscription hands the
//! queue back, with anything still buffered, for the next subscriber.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{is_valid_destination, AckTally, Acker, Broker, Delivery, DeliveryStream, Envelope};
use crate::error::{DeliveryError, PublishError, SubscribeError};

/// In-process [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    queues: Mutex<HashMap<String, LocalQueue>>,
    closed: AtomicBool,
    tally: Arc<AckTally>,
}

impl MemoryInner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, LocalQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LocalQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl LocalQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// Live subscription on one destination. Returns its receiver to the queue
/// on drop, so undelivered messages wait for the next subscriber.
struct LocalSubscription {
    destination: String,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
    broker: Weak<MemoryInner>,
}

impl Stream for LocalSubscription {
    type Item = Result<Delivery, DeliveryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx).map(|delivery| delivery.map(Ok)),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        let (Some(receiver), Some(broker)) = (self.receiver.take(), self.broker.upgrade()) else {
            return;
        };

        // After close the queue is gone and the receiver is simply dropped.
        if let Some(queue) = broker.queues().get_mut(&self.destination) {
            if queue.receiver.is_none() {
                queue.receiver = Some(receiver);
                debug!(destination = %self.destination, "memory_subscriber_detached");
            }
        };
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries acknowledged so far.
    pub fn acked_count(&self) -> usize {
        self.inner.tally.acked.load(Ordering::SeqCst)
    }

    /// Number of deliveries rejected so far.
    pub fn rejected_count(&self) -> usize {
        self.inner.tally.rejected.load(Ordering::SeqCst)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, LocalQueue>> {
        self.inner.queues()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), PublishError> {
        if !is_valid_destination(destination) {
            return Err(PublishError::InvalidDestination);
        }

        let delivery = Delivery::new(
            Some(envelope.message_id),
            envelope.body,
            Acker::Local(Arc::clone(&self.inner.tally)),
        );

        // `closed` is only set under this lock, so no queue can be created
        // once close has cleared them.
        let mut queues = self.queues();
        if self.is_closed() {
            return Err(PublishError::ConnectionUnavailable(
                "memory broker closed".to_string(),
            ));
        }

        queues
            .entry(destination.to_string())
            .or_insert_with(LocalQueue::new)
            .sender
            .send(delivery)
            .map_err(|_| PublishError::Broker("memory queue unavailable".to_string()))
    }

    async fn subscribe(&self, destination: &str) -> Result<DeliveryStream, SubscribeError> {
        if !is_valid_destination(destination) {
            return Err(SubscribeError::InvalidDestination);
        }

        let receiver = {
            let mut queues = self.queues();
            if self.is_closed() {
                return Err(SubscribeError::ConnectionUnavailable(
                    "memory broker closed".to_string(),
                ));
            }

            queues
                .entry(destination.to_string())
                .or_insert_with(LocalQueue::new)
                .receiver
                .take()
                .ok_or_else(|| SubscribeError::AlreadySubscribed(destination.to_string()))?
        };

        info!(destination = %destination, "memory_subscriber_attached");

        Ok(LocalSubscription {
            destination: destination.to_string(),
            receiver: Some(receiver),
            broker: Arc::downgrade(&self.inner),
        }
        .boxed())
    }

    async fn close(&self) {
        let mut queues = self.queues();
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every open stream once it is drained.
        queues.clear();
        drop(queues);
        info!("memory_broker_closed");
    }
}
