//! Connection handlers for the Beacon server.
//!
//! One task per live connection. Inbound envelopes from a single
//! connection are processed in arrival order; different connections'
//! handlers run concurrently with each other and with the relay's
//! consume loop.

use crate::access::StaticIdentityProvider;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_core::{
    Connection, Connections, DispatchError, EventDispatcher, Identity, Outbound, ResourceId,
    SubscribeError, SubscriptionRegistry, Topic,
};
use beacon_protocol::{codec, Envelope, EVENT_ERROR, EVENT_SUBSCRIBE, EVENT_UNSUBSCRIBE};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections on this process.
    pub connections: Arc<Connections>,
    /// The frozen validator table.
    pub registry: Arc<SubscriptionRegistry>,
    /// The frozen handler table.
    pub dispatcher: Arc<EventDispatcher>,
    /// Token-to-identity lookup for the handshake.
    pub identities: StaticIdentityProvider,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr()?;

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Beacon server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
///
/// Identity is established exactly once here, from the `token` query
/// parameter, and is immutable for the connection's lifetime.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let identity = params
        .get("token")
        .and_then(|token| state.identities.authenticate(token));

    match identity {
        Some(identity) => {
            ws.on_upgrade(move |socket| handle_websocket(socket, state, identity))
                .into_response()
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = Connection::generate_id();
    let (connection, mut outbound) = Connection::new(
        connection_id.clone(),
        identity,
        state.config.limits.outbound_capacity,
    );
    state.connections.insert(Arc::clone(&connection));

    debug!(connection = %connection_id, user = %connection.identity().user_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Writer task: drain the connection's outbound queue onto the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let envelope = to_envelope(frame);
            match codec::encode(&envelope) {
                Ok(text) => {
                    metrics::record_event("outbound");
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "Dropping unencodable outbound frame");
                    metrics::record_error("encode");
                }
            }
        }
    });

    // Read loop: one envelope at a time, in arrival order
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                metrics::record_event("inbound");
                let start = Instant::now();

                match codec::decode(&text) {
                    Ok(envelope) => handle_envelope(&state, &connection, envelope).await,
                    Err(error) => {
                        debug!(connection = %connection_id, error = %error, "Malformed envelope");
                        metrics::record_error("protocol");
                        let _ = connection.send(
                            EVENT_ERROR,
                            Topic::None,
                            ResourceId::None,
                            Some(json!({"message": "malformed envelope"})),
                        );
                    }
                }

                metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
            }
            Ok(Message::Binary(_)) => {
                debug!(connection = %connection_id, "Ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Keepalive handled by the transport layer
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Err(error) => {
                warn!(connection = %connection_id, error = %error, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // Teardown: close exactly once, dropping every held subscription
    connection.close();
    state.connections.remove(&connection_id);
    writer.abort();

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Route one decoded envelope.
///
/// `subscribe`/`unsubscribe` go to the registry; everything else to the
/// dispatcher. Failures are terminal for this envelope only and are
/// reported to the originating connection as generic error frames.
async fn handle_envelope(state: &AppState, connection: &Arc<Connection>, envelope: Envelope) {
    let topic = match envelope.topic.parse::<Topic>() {
        Ok(topic) => topic,
        Err(_) => {
            metrics::record_error("protocol");
            let _ = connection.send(
                EVENT_ERROR,
                Topic::None,
                ResourceId::None,
                Some(json!({"message": "unknown topic"})),
            );
            return;
        }
    };

    let resources: Vec<ResourceId> = match &envelope.topic_id {
        Some(topic_id) => topic_id.iter().map(ResourceId::from).collect(),
        None => vec![ResourceId::None],
    };

    match envelope.event.as_str() {
        EVENT_SUBSCRIBE => {
            for resource in resources {
                match state.registry.subscribe(connection, topic, resource).await {
                    // Silent success; no frame
                    Ok(()) => metrics::record_subscription(),
                    Err(error) => {
                        metrics::record_denial();
                        // Generic denial only; never reveal whether the
                        // resource exists or why access was refused
                        let message = match error {
                            SubscribeError::UnknownTopic(_) => "unknown topic",
                            SubscribeError::Denied => "subscription denied",
                            SubscribeError::SubscriptionLimit => "too many subscriptions",
                        };
                        let _ = connection.send(
                            EVENT_ERROR,
                            topic,
                            ResourceId::None,
                            Some(json!({"message": message})),
                        );
                    }
                }
            }
        }
        EVENT_UNSUBSCRIBE => {
            for resource in resources {
                state.registry.unsubscribe(connection, topic, &resource);
            }
        }
        event => {
            let payload = envelope.data.clone().unwrap_or(Value::Null);
            for resource in resources {
                let result = state
                    .dispatcher
                    .dispatch(connection, topic, event, resource, payload.clone())
                    .await;
                if let Err(DispatchError::UnknownEvent { .. }) = result {
                    metrics::record_error("protocol");
                    let _ = connection.send(
                        EVENT_ERROR,
                        topic,
                        ResourceId::None,
                        Some(json!({"message": "unknown event"})),
                    );
                }
            }
        }
    }
}

/// Convert a queued outbound frame to its wire envelope.
fn to_envelope(frame: Outbound) -> Envelope {
    let mut envelope = Envelope::new(frame.event, frame.topic.as_str());
    if frame.resource != ResourceId::None {
        envelope = envelope.with_topic_id(frame.resource.as_str());
    }
    if let Some(data) = frame.data {
        envelope = envelope.with_data(data);
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessControl;
    use crate::bootstrap;
    use crate::config::AuthConfig;
    use beacon_core::{
        build_cache, AccessControl, BroadcastRelay, CacheConfig, Identity, LocalBus,
    };
    use beacon_protocol::TopicId;
    use tokio::sync::mpsc::Receiver;

    async fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.auth = AuthConfig {
            tokens: HashMap::new(),
            assignments: HashMap::from([("U1".to_string(), vec!["42".to_string()])]),
            grants: HashMap::new(),
        };

        let access: Arc<dyn AccessControl> =
            Arc::new(StaticAccessControl::new(&config.auth));
        let cache = build_cache(&CacheConfig::default()).await.unwrap();
        let connections = Arc::new(Connections::new());
        let relay = Arc::new(BroadcastRelay::new(
            Arc::new(LocalBus::new()),
            Arc::clone(&connections),
        ));
        relay.start().await.unwrap();

        let handles =
            bootstrap::build_core(access, cache, relay, &config.limits).unwrap();

        Arc::new(AppState {
            connections,
            registry: handles.registry,
            dispatcher: handles.dispatcher,
            identities: StaticIdentityProvider::new(&config.auth),
            config,
        })
    }

    fn conn(user: &str) -> (Arc<Connection>, Receiver<Outbound>) {
        Connection::new(format!("conn-{user}"), Identity::user(user), 8)
    }

    #[tokio::test]
    async fn test_subscribe_success_is_silent() {
        let state = state().await;
        let (c, mut rx) = conn("U1");

        let envelope = Envelope::new(EVENT_SUBSCRIBE, "board").with_topic_id("42");
        handle_envelope(&state, &c, envelope).await;

        assert!(c.has_subscription(Topic::Board, &ResourceId::Id("42".to_string())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_denied_subscribe_gets_generic_frame() {
        let state = state().await;
        let (c, mut rx) = conn("U2");

        let envelope = Envelope::new(EVENT_SUBSCRIBE, "board").with_topic_id("42");
        handle_envelope(&state, &c, envelope).await;

        assert!(!c.has_subscription(Topic::Board, &ResourceId::Id("42".to_string())));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, EVENT_ERROR);
        assert_eq!(frame.data.unwrap()["message"], "subscription denied");
    }

    #[tokio::test]
    async fn test_subscribe_many_ids_at_once() {
        let state = state().await;
        let (c, _rx) = conn("U1");

        let envelope = Envelope::new(EVENT_SUBSCRIBE, "user").with_topic_id(TopicId::Many(
            vec!["u-1".to_string(), "u-2".to_string()],
        ));
        handle_envelope(&state, &c, envelope).await;

        assert_eq!(c.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_silent_and_removes() {
        let state = state().await;
        let (c, mut rx) = conn("U1");
        c.add_subscription(Topic::Board, ResourceId::Id("42".to_string()));

        let envelope = Envelope::new(EVENT_UNSUBSCRIBE, "board").with_topic_id("42");
        handle_envelope(&state, &c, envelope).await;

        assert_eq!(c.subscription_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_topic_gets_generic_frame() {
        let state = state().await;
        let (c, mut rx) = conn("U1");

        let envelope = Envelope::new("anything", "not-a-topic");
        handle_envelope(&state, &c, envelope).await;

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, EVENT_ERROR);
        assert_eq!(frame.data.unwrap()["message"], "unknown topic");
    }

    #[tokio::test]
    async fn test_unknown_event_gets_generic_frame() {
        let state = state().await;
        let (c, mut rx) = conn("U1");

        let envelope = Envelope::new("no-such-event", "global");
        handle_envelope(&state, &c, envelope).await;

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, EVENT_ERROR);
        assert_eq!(frame.data.unwrap()["message"], "unknown event");
    }

    #[test]
    fn test_to_envelope_omits_none_resource() {
        let envelope = to_envelope(Outbound {
            event: "announcement".to_string(),
            topic: Topic::Global,
            resource: ResourceId::None,
            data: Some(json!({"text": "hi"})),
        });
        assert_eq!(envelope.topic, "global");
        assert!(envelope.topic_id.is_none());

        let envelope = to_envelope(Outbound {
            event: "card-moved".to_string(),
            topic: Topic::Board,
            resource: ResourceId::Id("42".to_string()),
            data: None,
        });
        assert_eq!(envelope.topic_id, Some(TopicId::One("42".to_string())));
    }
}
