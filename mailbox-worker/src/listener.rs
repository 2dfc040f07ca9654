//! Listener registration and the container that drives it.
//!
//! Handlers are registered explicitly per destination before startup. The
//! container subscribes each destination and runs one worker task per
//! destination, which:
//! 1. Receives the next delivery from the broker
//! 2. Decodes it into an [`Email`]
//! 3. Invokes the handler and acknowledges, or rejects a malformed payload
//! 4. Stops when the container is shut down or the stream ends

use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{is_valid_destination, Broker, Delivery, DeliveryStream};
use crate::error::{DeliveryError, SubscribeError};
use crate::queue::{decode_email, Email};

/// Callback invoked once per delivered email.
pub type Handler = Arc<dyn Fn(Email) + Send + Sync>;

/// Mapping from destination name to its handler, built at startup.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, Handler>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("destinations", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `destination`.
    ///
    /// A destination takes exactly one handler.
    pub fn register<F>(&mut self, destination: &str, handler: F) -> Result<(), SubscribeError>
    where
        F: Fn(Email) + Send + Sync + 'static,
    {
        if !is_valid_destination(destination) {
            return Err(SubscribeError::InvalidDestination);
        }
        if self.listeners.contains_key(destination) {
            return Err(SubscribeError::DuplicateListener(destination.to_string()));
        }

        self.listeners
            .insert(destination.to_string(), Arc::new(handler));

        info!(destination = %destination, "listener_registered");
        Ok(())
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Decode one delivery and hand it to `handler`.
///
/// On success the handler runs exactly once and the delivery is acknowledged.
/// A payload that does not decode is rejected without requeue, the handler is
/// not called, and the decode error is returned. A handler that panics gets
/// its delivery rejected the same way, and the worker carries on.
pub async fn dispatch(delivery: &Delivery, handler: &Handler) -> Result<(), DeliveryError> {
    let email = match decode_email(&delivery.data) {
        Ok(email) => email,
        Err(e) => {
            reject(delivery).await;
            return Err(e);
        }
    };

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(email))) {
        reject(delivery).await;
        return Err(DeliveryError::HandlerPanicked(panic_message(payload.as_ref())));
    }

    delivery.ack().await
}

async fn reject(delivery: &Delivery) {
    if let Err(e) = delivery.reject().await {
        error!(
            message_id = %delivery.message_id_or_unknown(),
            error = %e,
            "mailbox_reject_failed"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Running set of listener workers.
pub struct ListenerContainer {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ListenerContainer {
    /// Subscribe every registered destination and start its worker.
    ///
    /// If any subscription fails, workers already started are stopped and
    /// the error is returned.
    pub async fn start(
        broker: Arc<dyn Broker>,
        registry: ListenerRegistry,
    ) -> Result<Self, SubscribeError> {
        let destinations: Vec<String> = registry.destinations().map(str::to_string).collect();
        let (shutdown, stop_rx) = watch::channel(false);
        let mut container = Self {
            shutdown,
            workers: Vec::with_capacity(registry.len()),
        };

        for (destination, handler) in registry.listeners {
            let stream = match broker.subscribe(&destination).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(destination = %destination, error = %e, "listener_subscribe_failed");
                    container.shutdown().await;
                    return Err(e);
                }
            };

            let stop_rx = stop_rx.clone();
            container
                .workers
                .push(tokio::spawn(run_listener(destination, stream, handler, stop_rx)));
        }

        info!(
            listeners = container.workers.len(),
            destinations = ?destinations,
            "listener_container_started"
        );
        Ok(container)
    }

    /// Stop every worker and wait for it to finish.
    pub async fn shutdown(self) {
        // Workers also stop when the sender is dropped, so a send error is fine.
        let _ = self.shutdown.send(true);

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "listener_worker_join_failed");
            }
        }

        info!("listener_container_stopped");
    }
}

async fn run_listener(
    destination: String,
    mut stream: DeliveryStream,
    handler: Handler,
    mut stop: watch::Receiver<bool>,
) {
    info!(destination = %destination, "listener_ready");

    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!(destination = %destination, "listener_stopping");
                break;
            }
            delivery = stream.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let message_id = delivery.message_id_or_unknown().to_string();

                        info!(
                            destination = %destination,
                            message_id = %message_id,
                            body_length = delivery.data.len(),
                            "mailbox_message_received"
                        );

                        match dispatch(&delivery, &handler).await {
                            Ok(()) => {
                                info!(
                                    destination = %destination,
                                    message_id = %message_id,
                                    "mailbox_message_handled"
                                );
                            }
                            Err(e) => {
                                error!(
                                    destination = %destination,
                                    message_id = %message_id,
                                    error = %e,
                                    body_preview = %String::from_utf8_lossy(
                                        &delivery.data[..delivery.data.len().min(500)]
                                    ),
                                    "mailbox_delivery_rejected"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(destination = %destination, error = %e, "listener_delivery_error");
                    }
                    None => {
                        warn!(destination = %destination, "listener_stream_closed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::broker::{Envelope, MemoryBroker};
    use crate::queue::{encode_email, Publisher, MAILBOX_QUEUE};

    const WAIT: Duration = Duration::from_secs(2);

    /// Registry whose mailbox handler forwards every email into a channel.
    fn forwarding_registry() -> (ListenerRegistry, mpsc::UnboundedReceiver<Email>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = ListenerRegistry::new();
        registry
            .register(MAILBOX_QUEUE, move |email| {
                let _ = tx.send(email);
            })
            .unwrap();
        (registry, rx)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut registry = ListenerRegistry::new();
        registry.register(MAILBOX_QUEUE, |_| {}).unwrap();

        let err = registry.register(MAILBOX_QUEUE, |_| {}).unwrap_err();
        assert!(matches!(err, SubscribeError::DuplicateListener(d) if d == MAILBOX_QUEUE));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_lists_destinations() {
        let mut registry = ListenerRegistry::new();
        registry.register(MAILBOX_QUEUE, |_| {}).unwrap();
        registry.register("archive", |_| {}).unwrap();

        let mut destinations: Vec<&str> = registry.destinations().collect();
        destinations.sort_unstable();
        assert_eq!(destinations, vec!["archive", MAILBOX_QUEUE]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_dispatch_panicking_handler_rejects() {
        let broker = MemoryBroker::new();
        let email = Email::new("info@example.com", "boom");
        broker
            .publish(MAILBOX_QUEUE, Envelope::new("m-1", encode_email(&email).unwrap()))
            .await
            .unwrap();
        let mut stream = broker.subscribe(MAILBOX_QUEUE).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let handler: Handler = Arc::new(|email: Email| panic!("cannot handle {}", email.body()));

        let err = dispatch(&delivery, &handler).await.unwrap_err();

        assert!(matches!(err, DeliveryError::HandlerPanicked(ref m) if m == "cannot handle boom"));
        assert_eq!(broker.rejected_count(), 1);
        assert_eq!(broker.acked_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_survives_handler_panic() {
        let broker = MemoryBroker::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = ListenerRegistry::new();
        registry
            .register(MAILBOX_QUEUE, move |email: Email| {
                if email.body() == "boom" {
                    panic!("handler failure");
                }
                let _ = tx.send(email);
            })
            .unwrap();
        let container = ListenerContainer::start(Arc::clone(&shared), registry)
            .await
            .unwrap();

        let publisher = Publisher::new(shared);
        publisher
            .send(MAILBOX_QUEUE, &Email::new("info@example.com", "boom"))
            .await
            .unwrap();
        let after = Email::new("info@example.com", "after");
        publisher.send(MAILBOX_QUEUE, &after).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), after);
        wait_until(|| broker.acked_count() == 1).await;
        assert_eq!(broker.rejected_count(), 1);
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_container_restarts_on_same_broker() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let (registry, _rx) = forwarding_registry();
        let first = ListenerContainer::start(Arc::clone(&broker), registry)
            .await
            .unwrap();
        first.shutdown().await;

        let pending = Email::new("info@example.com", "while stopped");
        Publisher::new(Arc::clone(&broker))
            .send(MAILBOX_QUEUE, &pending)
            .await
            .unwrap();

        let (registry, mut rx) = forwarding_registry();
        let second = ListenerContainer::start(broker, registry).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), pending);
        second.shutdown().await;
    }

    #[test]
    fn test_register_rejects_empty_destination() {
        let mut registry = ListenerRegistry::new();
        let err = registry.register("", |_| {}).unwrap_err();
        assert!(matches!(err, SubscribeError::InvalidDestination));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_malformed_skips_handler() {
        let broker = MemoryBroker::new();
        broker
            .publish(MAILBOX_QUEUE, Envelope::new("bad-1", b"{not json".to_vec()))
            .await
            .unwrap();
        let mut stream = broker.subscribe(MAILBOX_QUEUE).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Handler = Arc::new(move |_: Email| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = dispatch(&delivery, &handler).await.unwrap_err();

        assert!(matches!(err, DeliveryError::MalformedPayload(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.rejected_count(), 1);
        assert_eq!(broker.acked_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_valid_invokes_handler_and_acks() {
        let broker = MemoryBroker::new();
        let email = Email::new("info@example.com", "Hello");
        broker
            .publish(MAILBOX_QUEUE, Envelope::new("m-1", encode_email(&email).unwrap()))
            .await
            .unwrap();
        let mut stream = broker.subscribe(MAILBOX_QUEUE).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |email: Email| {
            let _ = tx.send(email);
        });

        dispatch(&delivery, &handler).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), email);
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.acked_count(), 1);
    }

    #[tokio::test]
    async fn test_send_hello_is_received_exactly_once() {
        let broker = MemoryBroker::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let (registry, mut rx) = forwarding_registry();

        let container = ListenerContainer::start(Arc::clone(&shared), registry)
            .await
            .unwrap();
        let publisher = Publisher::new(shared);

        let sent = Email::new("info@example.com", "Hello");
        publisher.send(MAILBOX_QUEUE, &sent).await.unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, sent);

        // No second invocation.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        wait_until(|| broker.acked_count() == 1).await;
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_body_survives_delivery() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let (registry, mut rx) = forwarding_registry();
        let container = ListenerContainer::start(Arc::clone(&broker), registry)
            .await
            .unwrap();

        Publisher::new(broker)
            .send(MAILBOX_QUEUE, &Email::new("info@example.com", ""))
            .await
            .unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.body(), "");
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_message_sent_before_start_is_delivered() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let email = Email::new("info@example.com", "early");
        Publisher::new(Arc::clone(&broker))
            .send(MAILBOX_QUEUE, &email)
            .await
            .unwrap();

        let (registry, mut rx) = forwarding_registry();
        let container = ListenerContainer::start(broker, registry).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), email);
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_delivery_does_not_stop_listener() {
        let broker = MemoryBroker::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let (registry, mut rx) = forwarding_registry();
        let container = ListenerContainer::start(Arc::clone(&shared), registry)
            .await
            .unwrap();

        shared
            .publish(MAILBOX_QUEUE, Envelope::new("bad-1", b"\xff\x00garbage".to_vec()))
            .await
            .unwrap();

        let good = Email::new("info@example.com", "after");
        Publisher::new(shared).send(MAILBOX_QUEUE, &good).await.unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), good);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        wait_until(|| broker.acked_count() == 1).await;
        assert_eq!(broker.rejected_count(), 1);
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_deliveries_arrive_in_publish_order() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let (registry, mut rx) = forwarding_registry();
        let container = ListenerContainer::start(Arc::clone(&broker), registry)
            .await
            .unwrap();

        let publisher = Publisher::new(broker);
        for i in 0..10 {
            publisher
                .send(MAILBOX_QUEUE, &Email::new("info@example.com", format!("n{i}")))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let email = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(email.body(), format!("n{i}"));
        }
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_destination_taken() {
        let broker = MemoryBroker::new();
        let _existing = broker.subscribe(MAILBOX_QUEUE).await.unwrap();

        let mut registry = ListenerRegistry::new();
        registry.register(MAILBOX_QUEUE, |_| {}).unwrap();

        let err = ListenerContainer::start(Arc::new(broker), registry)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SubscribeError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let (registry, _rx) = forwarding_registry();
        let container = ListenerContainer::start(broker, registry).await.unwrap();

        timeout(WAIT, container.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_exits_when_broker_closes() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let (registry, _rx) = forwarding_registry();
        let container = ListenerContainer::start(Arc::clone(&broker), registry)
            .await
            .unwrap();

        broker.close().await;

        timeout(WAIT, container.shutdown()).await.unwrap();
    }
}
