//! Connection abstraction for Beacon.
//!
//! One [`Connection`] exists per live client transport session. It owns
//! the outbound send queue, the set of (topic, resource) pairs it is
//! subscribed to, and its teardown. The subscription set is only ever
//! touched through the connection, guarded by its own lock; it is never
//! shared by raw reference across tasks.

use crate::topic::{ResourceId, Topic};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// The authenticated identity bound to a connection at handshake time.
///
/// Immutable for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authenticated user id.
    pub user_id: String,
    /// Whether this is a bot account rather than a human session.
    pub bot: bool,
}

impl Identity {
    /// Create a new human identity.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            bot: false,
        }
    }

    /// Create a new bot identity.
    #[must_use]
    pub fn bot(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            bot: true,
        }
    }
}

/// A frame queued for delivery to the client transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Event name, scoped within the topic.
    pub event: String,
    /// The topic kind.
    pub topic: Topic,
    /// Resource scoping.
    pub resource: ResourceId,
    /// Event-specific payload.
    pub data: Option<Value>,
}

/// Errors from [`Connection::send`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection has been closed; callers racing teardown should
    /// treat this as a normal, swallowable outcome.
    #[error("Connection closed")]
    Closed,
}

/// One live client session.
pub struct Connection {
    /// Unique connection id.
    id: String,
    /// Identity bound at handshake.
    identity: Identity,
    /// Bounded outbound queue drained by the transport writer task.
    outbound: mpsc::Sender<Outbound>,
    /// The (topic, resource) pairs this connection holds.
    subscriptions: Mutex<HashSet<(Topic, ResourceId)>>,
    /// Set exactly once at teardown.
    closed: AtomicBool,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    ///
    /// Returns the connection and the receiver the transport writer task
    /// drains.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        identity: Identity,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        let connection = Arc::new(Self {
            id: id.into(),
            identity,
            outbound: tx,
            subscriptions: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        (connection, rx)
    }

    /// Generate a unique connection id.
    #[must_use]
    pub fn generate_id() -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("conn_{timestamp:x}")
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The identity bound at handshake.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue one frame for delivery to the client.
    ///
    /// Never blocks: if the outbound queue is saturated the frame is
    /// dropped with a warning (delivery is best-effort, not guaranteed).
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] once the connection has been torn
    /// down, so callers can detect races between teardown and in-flight
    /// handler completion.
    pub fn send(
        &self,
        event: impl Into<String>,
        topic: Topic,
        resource: ResourceId,
        data: Option<Value>,
    ) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let frame = Outbound {
            event: event.into(),
            topic,
            resource,
            data,
        };

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    connection = %self.id,
                    event = %frame.event,
                    "Outbound queue full, dropping frame"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Add a subscription. Idempotent.
    ///
    /// Returns `true` if the pair was newly added.
    pub fn add_subscription(&self, topic: Topic, resource: ResourceId) -> bool {
        let mut subs = self.subscriptions.lock().unwrap();
        let added = subs.insert((topic, resource.clone()));
        if added {
            debug!(connection = %self.id, topic = %topic, resource = %resource, "Subscription added");
        }
        added
    }

    /// Remove a subscription. Idempotent.
    ///
    /// Returns `true` if the pair was held.
    pub fn remove_subscription(&self, topic: Topic, resource: &ResourceId) -> bool {
        let mut subs = self.subscriptions.lock().unwrap();
        let removed = subs.remove(&(topic, resource.clone()));
        if removed {
            debug!(connection = %self.id, topic = %topic, resource = %resource, "Subscription removed");
        }
        removed
    }

    /// Whether this exact (topic, resource) pair is held.
    #[must_use]
    pub fn has_subscription(&self, topic: Topic, resource: &ResourceId) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .contains(&(topic, resource.clone()))
    }

    /// Number of subscriptions currently held.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Snapshot of the subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(Topic, ResourceId)> {
        self.subscriptions.lock().unwrap().iter().cloned().collect()
    }

    /// Does a broadcast addressed to (topic, resource) match this
    /// connection's subscription set.
    ///
    /// A message addressed to [`ResourceId::All`] matches any
    /// subscription on the topic; a connection holding the `All`
    /// sentinel matches any resource on the topic.
    #[must_use]
    pub fn wants(&self, topic: Topic, resource: &ResourceId) -> bool {
        let subs = self.subscriptions.lock().unwrap();
        if *resource == ResourceId::All {
            return subs.iter().any(|(t, _)| *t == topic);
        }
        subs.contains(&(topic, resource.clone())) || subs.contains(&(topic, ResourceId::All))
    }

    /// Tear the connection down.
    ///
    /// Runs at most once: the first call removes every subscription the
    /// connection holds and returns them; later calls return an empty
    /// list. After close, `send` fails with [`SendError::Closed`].
    pub fn close(&self) -> Vec<(Topic, ResourceId)> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let mut subs = self.subscriptions.lock().unwrap();
        let dropped: Vec<_> = subs.drain().collect();
        debug!(
            connection = %self.id,
            subscriptions = dropped.len(),
            "Connection closed"
        );
        dropped
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The table of live connections held by this process.
///
/// The relay's consume loop iterates this to re-apply the local
/// subscription filter for every broadcast message.
#[derive(Default)]
pub struct Connections {
    inner: DashMap<String, Arc<Connection>>,
}

impl Connections {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection after handshake.
    pub fn insert(&self, connection: Arc<Connection>) {
        self.inner.insert(connection.id().to_string(), connection);
    }

    /// Remove a connection at teardown.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.remove(connection_id).map(|(_, c)| c)
    }

    /// Look up a connection by id.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.get(connection_id).map(|c| Arc::clone(&c))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.iter().map(|c| Arc::clone(&c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        Connection::new("conn-1", Identity::user("u-1"), capacity)
    }

    #[test]
    fn test_send_delivers_frame() {
        let (c, mut rx) = conn(8);
        c.send("hello", Topic::Global, ResourceId::None, Some(json!({"n": 1})))
            .unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, "hello");
        assert_eq!(frame.topic, Topic::Global);
        assert_eq!(frame.data.unwrap()["n"], 1);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (c, _rx) = conn(8);
        c.close();
        assert_eq!(
            c.send("hello", Topic::Global, ResourceId::None, None),
            Err(SendError::Closed)
        );
    }

    #[test]
    fn test_saturated_queue_drops_without_error() {
        let (c, mut rx) = conn(1);
        c.send("first", Topic::Global, ResourceId::None, None).unwrap();
        // Queue is full; the second frame is dropped but send still succeeds
        c.send("second", Topic::Global, ResourceId::None, None).unwrap();

        assert_eq!(rx.try_recv().unwrap().event, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_subscription_set_idempotent() {
        let (c, _rx) = conn(8);
        let r = ResourceId::Id("42".to_string());

        assert!(c.add_subscription(Topic::Board, r.clone()));
        assert!(!c.add_subscription(Topic::Board, r.clone()));
        assert_eq!(c.subscription_count(), 1);

        assert!(c.remove_subscription(Topic::Board, &r));
        assert!(!c.remove_subscription(Topic::Board, &r));
        assert_eq!(c.subscription_count(), 0);
    }

    #[test]
    fn test_wants_sentinel_matching() {
        let (c, _rx) = conn(8);
        c.add_subscription(Topic::Board, ResourceId::Id("42".to_string()));

        assert!(c.wants(Topic::Board, &ResourceId::Id("42".to_string())));
        assert!(!c.wants(Topic::Board, &ResourceId::Id("99".to_string())));
        // Messages addressed to all reach every subscriber on the topic
        assert!(c.wants(Topic::Board, &ResourceId::All));
        assert!(!c.wants(Topic::User, &ResourceId::All));

        // A connection holding the all sentinel matches any resource
        c.add_subscription(Topic::User, ResourceId::All);
        assert!(c.wants(Topic::User, &ResourceId::Id("u-9".to_string())));
    }

    #[test]
    fn test_close_runs_once_and_drops_subscriptions() {
        let (c, _rx) = conn(8);
        c.add_subscription(Topic::Board, ResourceId::Id("42".to_string()));
        c.add_subscription(Topic::Global, ResourceId::None);

        let dropped = c.close();
        assert_eq!(dropped.len(), 2);
        assert_eq!(c.subscription_count(), 0);

        // Second close is a no-op
        assert!(c.close().is_empty());
    }

    #[test]
    fn test_connections_table() {
        let table = Connections::new();
        let (c1, _rx1) = Connection::new("a", Identity::user("u-1"), 8);
        let (c2, _rx2) = Connection::new("b", Identity::bot("bot-1"), 8);

        table.insert(Arc::clone(&c1));
        table.insert(Arc::clone(&c2));
        assert_eq!(table.len(), 2);
        assert!(table.get("a").is_some());

        table.remove("a");
        assert!(table.get("a").is_none());
        assert_eq!(table.snapshot().len(), 1);
    }
}
