//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon realtime engine.
//!
//! Every logical event crosses the wire as a single JSON [`Envelope`]:
//!
//! ```text
//! { "event": "card-moved", "topic": "board", "topic_id": "42", "data": { ... } }
//! ```
//!
//! `topic_id` is a string or an array of strings and is omitted entirely
//! for topics with no sub-resource scoping. `data` carries the
//! event-specific payload and is opaque to the protocol layer.

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_ENVELOPE_SIZE};
pub use envelope::{Envelope, TopicId};

/// Client control event: subscribe to a topic.
pub const EVENT_SUBSCRIBE: &str = "subscribe";

/// Client control event: unsubscribe from a topic.
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";

/// Server-originated generic error event.
pub const EVENT_ERROR: &str = "error";
