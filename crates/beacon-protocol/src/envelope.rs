//! The wire envelope for Beacon events.
//!
//! Envelopes are the messages exchanged between clients and servers.
//! The same shape is used in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource scoping for an envelope.
///
/// A client may address a single resource or several at once
/// (`"topic_id": "42"` or `"topic_id": ["42", "43"]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicId {
    /// A single resource id.
    One(String),
    /// Several resource ids.
    Many(Vec<String>),
}

impl TopicId {
    /// Iterate over the resource ids, regardless of arity.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            TopicId::One(id) => std::slice::from_ref(id),
            TopicId::Many(ids) => ids,
        };
        slice.iter().map(String::as_str)
    }
}

impl From<&str> for TopicId {
    fn from(id: &str) -> Self {
        TopicId::One(id.to_string())
    }
}

impl From<Vec<String>> for TopicId {
    fn from(ids: Vec<String>) -> Self {
        TopicId::Many(ids)
    }
}

/// A protocol envelope.
///
/// One envelope per logical event, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, scoped within a topic.
    pub event: String,

    /// One of the enumerated topic kinds.
    pub topic: String,

    /// Resource scoping; omitted for topics with no sub-resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,

    /// Event-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Create a new envelope with no resource scoping or payload.
    #[must_use]
    pub fn new(event: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            topic: topic.into(),
            topic_id: None,
            data: None,
        }
    }

    /// Attach a resource id.
    #[must_use]
    pub fn with_topic_id(mut self, topic_id: impl Into<TopicId>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create a generic error envelope.
    ///
    /// The message is intentionally generic; it must never carry
    /// resource-identifying detail or internal error strings.
    #[must_use]
    pub fn error(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event: crate::EVENT_ERROR.to_string(),
            topic: topic.into(),
            topic_id: None,
            data: Some(serde_json::json!({ "message": message.into() })),
        }
    }
}
