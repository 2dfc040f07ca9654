//! Mailbox - typed email messaging over a broker.
//!
//! This library provides the pieces used by the `mailbox-demo` binary:
//! - `queue`: the `Email` message, its JSON codec and the publisher
//! - `listener`: explicit handler registration and the listener container
//! - `broker`: the broker abstraction with RabbitMQ and in-process transports
//!
//! ## Architecture
//!
//! ```text
//! Publisher → Broker → mailBox queue → ListenerContainer → handler
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod listener;
pub mod queue;

// Re-export commonly used types
pub use broker::{AmqpBroker, Broker, Delivery, Envelope, MemoryBroker};
pub use config::{Config, Transport};
pub use error::{DeliveryError, PublishError, SubscribeError};
pub use listener::{dispatch, Handler, ListenerContainer, ListenerRegistry};
pub use queue::{decode_email, encode_email, Email, Publisher, MAILBOX_QUEUE};
