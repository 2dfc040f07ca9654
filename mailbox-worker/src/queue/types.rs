//! Message types carried over the mailbox queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue name for email messages.
pub const MAILBOX_QUEUE: &str = "mailBox";

/// Content type attached to every published payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An email message: recipient address plus body text.
///
/// Immutable once built. Two emails are equal when both fields are equal.
/// Empty strings are valid; a missing or `null` field is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Email {
    to: String,
    body: String,
}

impl Email {
    /// Create a new email.
    pub fn new(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: body.into(),
        }
    }

    /// Recipient address.
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Body text.
    pub fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Email{{to={}, body={}}}", self.to, self.body)
    }
}
