//! JSON wire encoding for [`Email`].
//!
//! The publisher and the listener share this pair of functions, so whatever
//! `encode_email` writes is exactly what `decode_email` reads back.

use crate::error::{DeliveryError, PublishError};

use super::types::Email;

/// Serialize an email into the JSON payload `{"to": ..., "body": ...}`.
pub fn encode_email(email: &Email) -> Result<Vec<u8>, PublishError> {
    Ok(serde_json::to_vec(email)?)
}

/// Deserialize a payload produced by [`encode_email`].
///
/// Rejects non-JSON bytes, missing or `null` fields and unknown fields.
pub fn decode_email(payload: &[u8]) -> Result<Email, DeliveryError> {
    serde_json::from_slice(payload).map_err(DeliveryError::MalformedPayload)
}
