//! # beacon-core
//!
//! Topic-based publish/subscribe authorization and event dispatch for the
//! Beacon realtime engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - Closed taxonomy of authorization domains
//! - **Connection** - One per live client session, owns its subscriptions
//! - **SubscriptionRegistry** - One authorization validator per topic
//! - **EventDispatcher** - Routes (topic, event) pairs to handlers
//! - **BroadcastRelay** - Cross-process fan-out over a shared bus
//! - **Cache** - Ephemeral key/value state with pluggable backends
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────┐    ┌──────────────────┐
//! │ Connection │───▶│ Dispatcher  │───▶│ handler (DI'd    │
//! └────────────┘    └─────────────┘    │ cache / relay)   │
//!       ▲                              └──────────────────┘
//!       │                                       │
//! ┌─────┴──────┐    ┌─────────────┐             │
//! │   Relay    │◀───│  RelayBus   │◀────────────┘
//! └────────────┘    └─────────────┘
//! ```
//!
//! Validator and handler tables are built once at startup through the
//! [`registry::RegistryBuilder`] and [`dispatcher::DispatcherBuilder`] and
//! are read-only thereafter.

pub mod access;
pub mod cache;
pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod relay;
pub mod topic;

pub use access::AccessControl;
pub use cache::{build_cache, Cache, CacheBackend, CacheConfig, CacheError};
pub use connection::{Connection, Connections, Identity, Outbound, SendError};
pub use dispatcher::{DispatchError, DispatcherBuilder, EventContext, EventDispatcher};
pub use registry::{
    ConfigurationError, RegistryBuilder, SubscribeError, SubscriptionRegistry, ValidatorContext,
};
pub use relay::{
    build_bus, BroadcastMessage, BroadcastRelay, LocalBus, RedisBus, RelayBus, RelayConfig,
    RelayError,
};
pub use topic::{ResourceId, Topic};
