//! Cross-process broadcast relay for Beacon.
//!
//! Any process can originate an event; every process independently
//! re-applies its local subscription filter when consuming, so
//! authorization is enforced once at subscribe time and fan-out needs no
//! re-authorization per message. Delivery is best-effort/at-most-once:
//! failures are logged and the message dropped, never redelivered.

use crate::connection::{Connections, SendError};
use crate::topic::{ResourceId, Topic};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default capacity of the bus queues.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// One message on the relay bus. Transient; never persisted beyond
/// delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// The topic the event belongs to.
    pub topic: Topic,
    /// Resource scoping; [`ResourceId::All`] reaches every subscriber on
    /// the topic.
    pub resource: ResourceId,
    /// Event name, scoped within the topic.
    pub event: String,
    /// Event-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// The process that originated the message.
    pub origin: String,
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The bus transport failed.
    #[error("Relay bus error: {0}")]
    Bus(String),

    /// A bus message could not be (de)serialized.
    #[error("Relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for RelayError {
    fn from(error: redis::RedisError) -> Self {
        RelayError::Bus(error.to_string())
    }
}

/// A shared transport visible to all server processes.
///
/// Ordering is preserved per originating process only; no global order
/// is guaranteed across processes.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Hand a message to the bus.
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), RelayError>;

    /// Open a consume stream over the bus.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, RelayError>;
}

/// In-process bus for single-process deployments and tests.
///
/// Fan-out over a `tokio::sync::broadcast` channel; receivers that fall
/// behind skip messages, which is the at-most-once policy.
pub struct LocalBus {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl LocalBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for LocalBus {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), RelayError> {
        // No receivers yet is fine; the message is simply dropped
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, RelayError> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(DEFAULT_BUS_CAPACITY);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break; // Consumer dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Relay consumer lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

/// Redis pub/sub bus for multi-process deployments.
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
    channel: String,
}

impl RedisBus {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns a [`RelayError`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), RelayError> {
        let text = serde_json::to_string(message)?;
        let mut conn = self.publisher.clone();
        let _: () = redis::AsyncCommands::publish(&mut conn, &self.channel, text).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let (tx, rx) = mpsc::channel(DEFAULT_BUS_CAPACITY);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "Unreadable bus message, dropping");
                        continue;
                    }
                };
                match serde_json::from_str::<BroadcastMessage>(&payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break; // Consumer dropped
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "Malformed bus message, dropping");
                    }
                }
            }
            debug!("Redis bus subscription ended");
        });

        Ok(rx)
    }
}

/// Bus selection, decided once at process startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RelayConfig {
    /// In-process bus.
    Local {
        /// Bus queue capacity.
        #[serde(default = "default_bus_capacity")]
        capacity: usize,
    },
    /// Redis pub/sub bus shared by all processes.
    Redis {
        /// Redis connection URL.
        url: String,
        /// Pub/sub channel name.
        #[serde(default = "default_bus_channel")]
        channel: String,
    },
}

fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}

fn default_bus_channel() -> String {
    "beacon:relay".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::Local {
            capacity: default_bus_capacity(),
        }
    }
}

/// Build the relay bus from configuration.
///
/// # Errors
///
/// Returns a [`RelayError`] if the bus backend cannot be reached.
pub async fn build_bus(config: &RelayConfig) -> Result<Arc<dyn RelayBus>, RelayError> {
    match config {
        RelayConfig::Local { capacity } => {
            info!(capacity = *capacity, "Using in-process relay bus");
            Ok(Arc::new(LocalBus::with_capacity(*capacity)))
        }
        RelayConfig::Redis { url, channel } => {
            info!(channel = %channel, "Using Redis relay bus");
            Ok(Arc::new(RedisBus::connect(url, channel.clone()).await?))
        }
    }
}

/// The per-process relay instance.
///
/// Handlers publish through it; its consume loop delivers bus messages
/// to every local connection whose subscription set matches.
pub struct BroadcastRelay {
    bus: Arc<dyn RelayBus>,
    connections: Arc<Connections>,
    process_id: String,
}

impl BroadcastRelay {
    /// Create a relay over a bus and this process's connection table.
    #[must_use]
    pub fn new(bus: Arc<dyn RelayBus>, connections: Arc<Connections>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self {
            bus,
            connections,
            process_id: format!("proc_{timestamp:x}"),
        }
    }

    /// This process's origin id.
    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Publish a server-originated event to all processes.
    ///
    /// Best-effort: a bus failure is logged and the message dropped.
    pub async fn publish(
        &self,
        topic: Topic,
        resource: ResourceId,
        event: impl Into<String>,
        payload: Option<Value>,
    ) {
        let message = BroadcastMessage {
            topic,
            resource,
            event: event.into(),
            payload,
            origin: self.process_id.clone(),
        };

        if let Err(error) = self.bus.publish(&message).await {
            warn!(
                topic = %message.topic,
                event = %message.event,
                error = %error,
                "Relay publish failed, dropping message"
            );
        }
    }

    /// Start the consume loop.
    ///
    /// Runs for the process lifetime; it is stopped only by aborting the
    /// returned handle at shutdown, discarding in-flight messages.
    ///
    /// # Errors
    ///
    /// Returns a [`RelayError`] if the bus subscription cannot be opened.
    pub async fn start(&self) -> Result<JoinHandle<()>, RelayError> {
        let mut stream = self.bus.subscribe().await?;
        let connections = Arc::clone(&self.connections);
        let process_id = self.process_id.clone();

        Ok(tokio::spawn(async move {
            info!(process = %process_id, "Relay consume loop started");
            while let Some(message) = stream.recv().await {
                deliver(&connections, &message);
            }
            debug!(process = %process_id, "Relay consume loop ended");
        }))
    }
}

/// Re-apply the local subscription filter and deliver one message.
fn deliver(connections: &Connections, message: &BroadcastMessage) {
    let mut delivered = 0usize;
    for connection in connections.snapshot() {
        if !connection.wants(message.topic, &message.resource) {
            continue;
        }
        match connection.send(
            message.event.clone(),
            message.topic,
            message.resource.clone(),
            message.payload.clone(),
        ) {
            Ok(()) => delivered += 1,
            // Teardown race; the connection is already gone
            Err(SendError::Closed) => {}
        }
    }
    trace!(
        topic = %message.topic,
        resource = %message.resource,
        event = %message.event,
        delivered,
        "Relay delivered message"
    );
}
