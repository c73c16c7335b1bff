//! Codec for encoding and decoding Beacon envelopes.
//!
//! Envelopes travel as JSON text, one per transport frame. The codec
//! enforces a maximum envelope size in both directions so a single
//! client cannot force unbounded allocations.

use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum envelope size (64 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Malformed inbound envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Encode an envelope to JSON text.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope).map_err(ProtocolError::Encode)?;

    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    Ok(text)
}

/// Decode an envelope from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}
