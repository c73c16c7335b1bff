//! The topic taxonomy for Beacon.
//!
//! Topics are authorization domains for realtime events. The set is
//! closed: every subscription and every dispatched event names exactly
//! one of these kinds. Resource ids scope a subscription to a specific
//! instance within the topic's domain (e.g. one board).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved resource id meaning "broadcast to everyone on the topic".
pub const RESOURCE_ALL: &str = "all";

/// Reserved resource id meaning "no sub-resource scoping".
pub const RESOURCE_NONE: &str = "none";

/// A topic kind.
///
/// Carries no payload; it only identifies an authorization domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// A board's activity stream.
    Board,
    /// Public per-user events (profile changes, status).
    User,
    /// Events visible only to the user themselves.
    UserPrivate,
    /// Application-wide settings changes.
    AppSettings,
    /// Server-wide announcements.
    Global,
    /// The null topic; nothing is subscribable here.
    None,
}

/// Error returned when parsing an unknown topic name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl Topic {
    /// The wire name of this topic.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Board => "board",
            Topic::User => "user",
            Topic::UserPrivate => "user-private",
            Topic::AppSettings => "app-settings",
            Topic::Global => "global",
            Topic::None => "none",
        }
    }

    /// All topic kinds, in declaration order.
    #[must_use]
    pub fn all() -> &'static [Topic] {
        &[
            Topic::Board,
            Topic::User,
            Topic::UserPrivate,
            Topic::AppSettings,
            Topic::Global,
            Topic::None,
        ]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "board" => Ok(Topic::Board),
            "user" => Ok(Topic::User),
            "user-private" => Ok(Topic::UserPrivate),
            "app-settings" => Ok(Topic::AppSettings),
            "global" => Ok(Topic::Global),
            "none" => Ok(Topic::None),
            other => Err(UnknownTopic(other.to_string())),
        }
    }
}

/// Resource scoping within a topic.
///
/// Either a concrete resource id, or one of the two reserved sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// Matches every resource in the topic.
    All,
    /// The topic has no sub-resource scoping.
    None,
    /// A specific resource instance.
    Id(String),
}

impl ResourceId {
    /// The wire representation of this resource id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ResourceId::All => RESOURCE_ALL,
            ResourceId::None => RESOURCE_NONE,
            ResourceId::Id(id) => id,
        }
    }

    /// The concrete id, if this is not a sentinel.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            ResourceId::Id(id) => Some(id),
            _ => None,
        }
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        match s {
            RESOURCE_ALL => ResourceId::All,
            // An absent or empty id means "unscoped"
            RESOURCE_NONE | "" => ResourceId::None,
            other => ResourceId::Id(other.to_string()),
        }
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId::from(s.as_str())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ResourceId::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_roundtrip() {
        for topic in Topic::all() {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), *topic);
        }
    }

    #[test]
    fn test_topic_unknown() {
        assert_eq!(
            "boards".parse::<Topic>(),
            Err(UnknownTopic("boards".to_string()))
        );
        assert!("".parse::<Topic>().is_err());
    }

    #[test]
    fn test_topic_serde_names() {
        assert_eq!(
            serde_json::to_string(&Topic::UserPrivate).unwrap(),
            "\"user-private\""
        );
        assert_eq!(
            serde_json::from_str::<Topic>("\"app-settings\"").unwrap(),
            Topic::AppSettings
        );
    }

    #[test]
    fn test_resource_id_sentinels() {
        assert_eq!(ResourceId::from("all"), ResourceId::All);
        assert_eq!(ResourceId::from("none"), ResourceId::None);
        assert_eq!(ResourceId::from(""), ResourceId::None);
        assert_eq!(ResourceId::from("42"), ResourceId::Id("42".to_string()));
    }

    #[test]
    fn test_resource_id_serde() {
        assert_eq!(serde_json::to_string(&ResourceId::All).unwrap(), "\"all\"");
        assert_eq!(
            serde_json::from_str::<ResourceId>("\"42\"").unwrap(),
            ResourceId::Id("42".to_string())
        );
    }
}
