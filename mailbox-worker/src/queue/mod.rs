//! Queue module for the mailbox destination.
//!
//! This module provides:
//! - The `Email` message type and destination name
//! - The JSON codec shared by both ends
//! - The publisher that enqueues emails
//!
//! ## Flow
//!
//! ```text
//! Publisher → mailBox queue → Listener
//! ```

pub mod codec;
pub mod publisher;
pub mod types;

pub use codec::{decode_email, encode_email};
pub use publisher::Publisher;
pub use types::{Email, CONTENT_TYPE_JSON, MAILBOX_QUEUE};
