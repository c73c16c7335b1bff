//! Event dispatch for Beacon.
//!
//! Inbound client events are routed to independently registered handlers
//! keyed by (topic, event name); there is no central switch statement.
//! The handler table is built once at startup and read-only thereafter.

use crate::connection::Connection;
use crate::topic::{ResourceId, Topic};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Event name of the generic error frame sent back on handler failure.
pub const EVENT_ERROR: &str = "error";

/// Context handed to an event handler.
///
/// The handler's return value is not auto-sent; a single inbound event
/// can legitimately produce zero, one, or many outbound frames, so
/// handlers call [`Connection::send`] or publish to the relay themselves.
#[derive(Clone)]
pub struct EventContext {
    /// The originating connection.
    pub connection: Arc<Connection>,
    /// The topic the event arrived on.
    pub topic: Topic,
    /// Resource scoping from the envelope.
    pub topic_id: ResourceId,
    /// Event payload; `Value::Null` when the envelope carried none.
    pub payload: Value,
}

/// A registered event handler.
pub type HandlerFn =
    Arc<dyn Fn(EventContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Errors from [`EventDispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler registered for the (topic, event) pair. Reported to
    /// the client as a generic protocol error, not a server fault.
    #[error("No handler for event {event} on topic {topic}")]
    UnknownEvent {
        /// The topic the event arrived on.
        topic: Topic,
        /// The unrecognized event name.
        event: String,
    },
}

/// Builder for the handler table.
pub struct DispatcherBuilder {
    handlers: HashMap<(Topic, String), HandlerFn>,
}

impl DispatcherBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a (topic, event) pair.
    ///
    /// A later registration for the same pair overwrites the earlier one
    /// with a warning.
    #[must_use]
    pub fn on<F, Fut>(mut self, topic: Topic, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event = event.into();
        let handler: HandlerFn = Arc::new(move |ctx| Box::pin(f(ctx)));

        if self
            .handlers
            .insert((topic, event.clone()), handler)
            .is_some()
        {
            warn!(topic = %topic, event = %event, "Handler overwritten for (topic, event) pair");
        }
        self
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> EventDispatcher {
        debug!(handlers = self.handlers.len(), "Event dispatcher built");
        EventDispatcher {
            handlers: self.handlers,
        }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen handler table. Read-only after startup.
pub struct EventDispatcher {
    handlers: HashMap<(Topic, String), HandlerFn>,
}

impl EventDispatcher {
    /// Dispatch one decoded inbound event to its handler.
    ///
    /// Handler failures are caught here: they are logged and converted
    /// to a generic error frame sent back to the originating connection
    /// only. Dispatch for other connections continues unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownEvent`] if no handler is
    /// registered for the pair.
    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        topic: Topic,
        event: &str,
        topic_id: ResourceId,
        payload: Value,
    ) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(&(topic, event.to_string()))
            .ok_or_else(|| DispatchError::UnknownEvent {
                topic,
                event: event.to_string(),
            })?;

        let ctx = EventContext {
            connection: Arc::clone(connection),
            topic,
            topic_id,
            payload,
        };

        if let Err(cause) = handler(ctx).await {
            error!(
                connection = %connection.id(),
                topic = %topic,
                event = %event,
                error = %cause,
                "Handler failed"
            );
            // Generic frame only; never internals. A Closed error here is
            // a normal teardown race.
            let _ = connection.send(
                EVENT_ERROR,
                topic,
                ResourceId::None,
                Some(serde_json::json!({ "message": "internal error" })),
            );
        }

        Ok(())
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn conn() -> (Arc<Connection>, mpsc::Receiver<crate::connection::Outbound>) {
        Connection::new("conn-1", Identity::user("u-1"), 8)
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_with_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let dispatcher = DispatcherBuilder::new()
            .on(Topic::Board, "card-moved", move |ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    assert_eq!(ctx.topic, Topic::Board);
                    assert_eq!(ctx.topic_id.id(), Some("42"));
                    assert_eq!(ctx.payload["card"], "c-1");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let (c, _rx) = conn();
        dispatcher
            .dispatch(
                &c,
                Topic::Board,
                "card-moved",
                ResourceId::Id("42".to_string()),
                json!({"card": "c-1"}),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let dispatcher = DispatcherBuilder::new().build();
        let (c, _rx) = conn();

        let result = dispatcher
            .dispatch(&c, Topic::Board, "nope", ResourceId::None, Value::Null)
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::UnknownEvent { topic: Topic::Board, .. })
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_sends_generic_error_frame() {
        let dispatcher = DispatcherBuilder::new()
            .on(Topic::Board, "explode", |_ctx| async {
                anyhow::bail!("secret database detail")
            })
            .build();

        let (c, mut rx) = conn();
        dispatcher
            .dispatch(&c, Topic::Board, "explode", ResourceId::None, Value::Null)
            .await
            .unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, EVENT_ERROR);
        // The cause must not leak to the client
        assert_eq!(frame.data.unwrap()["message"], "internal error");
    }

    #[tokio::test]
    async fn test_handler_failure_on_closed_connection_is_swallowed() {
        let dispatcher = DispatcherBuilder::new()
            .on(Topic::Board, "explode", |_ctx| async { anyhow::bail!("boom") })
            .build();

        let (c, _rx) = conn();
        c.close();

        // Must not propagate the Closed send error
        dispatcher
            .dispatch(&c, Topic::Board, "explode", ResourceId::None, Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_later_registration_overwrites() {
        let dispatcher = DispatcherBuilder::new()
            .on(Topic::Global, "announce", |ctx| async move {
                ctx.connection
                    .send("old", Topic::Global, ResourceId::None, None)?;
                Ok(())
            })
            .on(Topic::Global, "announce", |ctx| async move {
                ctx.connection
                    .send("new", Topic::Global, ResourceId::None, None)?;
                Ok(())
            })
            .build();
        assert_eq!(dispatcher.len(), 1);

        let (c, mut rx) = conn();
        dispatcher
            .dispatch(&c, Topic::Global, "announce", ResourceId::None, Value::Null)
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().event, "new");
    }

    #[tokio::test]
    async fn test_same_event_name_on_different_topics() {
        let dispatcher = DispatcherBuilder::new()
            .on(Topic::Board, "changed", |_ctx| async { Ok(()) })
            .on(Topic::AppSettings, "changed", |_ctx| async { Ok(()) })
            .build();
        assert_eq!(dispatcher.len(), 2);
    }
}
