//! The explicit startup registration phase.
//!
//! All (topic, validator) and (topic, event, handler) pairs are declared
//! here and frozen into immutable lookup tables before the listener
//! starts accepting connections. Handlers receive their collaborators
//! (access control, cache, relay) by capture at registration time, not
//! through ambient globals.

use crate::config::LimitsConfig;
use crate::metrics;
use anyhow::bail;
use beacon_core::{
    AccessControl, BroadcastRelay, Cache, ConfigurationError, DispatcherBuilder, EventDispatcher,
    RegistryBuilder, ResourceId, SendError, SubscriptionRegistry, Topic,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a typing indicator stays live in the cache.
const TYPING_TTL: Duration = Duration::from_secs(5);

/// The frozen core tables, built once at startup.
pub struct CoreHandles {
    /// The validator table.
    pub registry: Arc<SubscriptionRegistry>,
    /// The handler table.
    pub dispatcher: Arc<EventDispatcher>,
}

/// Build the validator and handler tables.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] on duplicate validator registration.
/// This is fatal; the process must not start with an inconsistent table.
pub fn build_core(
    access: Arc<dyn AccessControl>,
    cache: Cache,
    relay: Arc<BroadcastRelay>,
    limits: &LimitsConfig,
) -> Result<CoreHandles, ConfigurationError> {
    let registry = build_registry(Arc::clone(&access), limits)?;
    let dispatcher = build_dispatcher(access, cache, relay);

    info!(
        topics = registry.topics().len(),
        handlers = dispatcher.len(),
        "Core tables built"
    );

    Ok(CoreHandles {
        registry: Arc::new(registry),
        dispatcher: Arc::new(dispatcher),
    })
}

/// One validator per topic kind.
fn build_registry(
    access: Arc<dyn AccessControl>,
    limits: &LimitsConfig,
) -> Result<SubscriptionRegistry, ConfigurationError> {
    let board_access = Arc::clone(&access);
    let settings_access = Arc::clone(&access);

    let registry = RegistryBuilder::new()
        .max_subscriptions(limits.max_subscriptions_per_connection)
        // Board streams require assignment to the specific board
        .validator(Topic::Board, move |ctx| {
            let access = Arc::clone(&board_access);
            async move {
                match &ctx.resource {
                    ResourceId::Id(board_id) => {
                        access
                            .is_assigned(&ctx.connection.identity().user_id, board_id)
                            .await
                    }
                    _ => Ok(false),
                }
            }
        })?
        // Public user topics are open to any authenticated connection,
        // but only for a concrete user id
        .validator(Topic::User, |ctx| async move {
            Ok(matches!(ctx.resource, ResourceId::Id(_)))
        })?
        // A user may only follow their own private stream
        .validator(Topic::UserPrivate, |ctx| async move {
            Ok(ctx.resource.id() == Some(ctx.connection.identity().user_id.as_str()))
        })?
        // Settings changes are restricted to users granted read access
        .validator(Topic::AppSettings, move |ctx| {
            let access = Arc::clone(&settings_access);
            async move {
                if ctx.resource != ResourceId::None {
                    return Ok(false);
                }
                access
                    .is_granted(&ctx.connection.identity().user_id, "app-settings", "read")
                    .await
            }
        })?
        // Global announcements are readable by everyone
        .validator(Topic::Global, |ctx| async move {
            Ok(ctx.resource == ResourceId::None || ctx.resource == ResourceId::All)
        })?
        // Nothing is subscribable on the null topic
        .validator(Topic::None, |_ctx| async { Ok(false) })?
        .build();

    Ok(registry)
}

/// One handler per (topic, event) pair.
fn build_dispatcher(
    access: Arc<dyn AccessControl>,
    cache: Cache,
    relay: Arc<BroadcastRelay>,
) -> EventDispatcher {
    DispatcherBuilder::new()
        .on(Topic::Board, "card-moved", {
            let access = Arc::clone(&access);
            let relay = Arc::clone(&relay);
            move |ctx| {
                let access = Arc::clone(&access);
                let relay = Arc::clone(&relay);
                async move {
                    let user_id = &ctx.connection.identity().user_id;
                    let Some(board_id) = ctx.topic_id.id() else {
                        bail!("card-moved requires a board id");
                    };
                    if !access.is_granted(user_id, board_id, "edit").await? {
                        bail!("user {user_id} may not edit board {board_id}");
                    }
                    metrics::record_relay_publish();
                    relay
                        .publish(
                            Topic::Board,
                            ctx.topic_id.clone(),
                            "card-moved",
                            Some(ctx.payload.clone()),
                        )
                        .await;
                    Ok(())
                }
            }
        })
        .on(Topic::Board, "board-changed", {
            let access = Arc::clone(&access);
            let relay = Arc::clone(&relay);
            move |ctx| {
                let access = Arc::clone(&access);
                let relay = Arc::clone(&relay);
                async move {
                    let user_id = &ctx.connection.identity().user_id;
                    let Some(board_id) = ctx.topic_id.id() else {
                        bail!("board-changed requires a board id");
                    };
                    if !access.is_granted(user_id, board_id, "edit").await? {
                        bail!("user {user_id} may not edit board {board_id}");
                    }
                    metrics::record_relay_publish();
                    relay
                        .publish(
                            Topic::Board,
                            ctx.topic_id.clone(),
                            "board-changed",
                            Some(ctx.payload.clone()),
                        )
                        .await;
                    Ok(())
                }
            }
        })
        .on(Topic::Board, "typing", {
            let cache = cache.clone();
            let relay = Arc::clone(&relay);
            move |ctx| {
                let cache = cache.clone();
                let relay = Arc::clone(&relay);
                async move {
                    let user_id = ctx.connection.identity().user_id.clone();
                    let key = format!("typing:{}:{user_id}", ctx.topic_id);

                    // Cache failure degrades to an uncached indicator;
                    // the event still fans out
                    if let Err(error) = cache
                        .set(&key, serde_json::json!(true), Some(TYPING_TTL))
                        .await
                    {
                        warn!(error = %error, "Typing indicator not cached");
                        metrics::record_error("cache");
                    }

                    metrics::record_relay_publish();
                    relay
                        .publish(
                            Topic::Board,
                            ctx.topic_id.clone(),
                            "typing",
                            Some(serde_json::json!({ "user_id": user_id })),
                        )
                        .await;
                    Ok(())
                }
            }
        })
        // Direct reply on the originating connection only
        .on(Topic::UserPrivate, "presence-ping", |ctx| async move {
            let reply = ctx.connection.send(
                "presence-pong",
                Topic::UserPrivate,
                ctx.topic_id.clone(),
                Some(ctx.payload.clone()),
            );
            match reply {
                // Teardown race; nothing to deliver to
                Err(SendError::Closed) => Ok(()),
                Ok(()) => Ok(()),
            }
        })
        .on(Topic::Global, "announce", {
            let access = Arc::clone(&access);
            let relay = Arc::clone(&relay);
            move |ctx| {
                let access = Arc::clone(&access);
                let relay = Arc::clone(&relay);
                async move {
                    let user_id = &ctx.connection.identity().user_id;
                    if !access.is_granted(user_id, "global", "announce").await? {
                        bail!("user {user_id} may not announce");
                    }
                    metrics::record_relay_publish();
                    relay
                        .publish(
                            Topic::Global,
                            ResourceId::All,
                            "announcement",
                            Some(ctx.payload.clone()),
                        )
                        .await;
                    Ok(())
                }
            }
        })
        .build()
}
