//! Subscription authorization for Beacon.
//!
//! Exactly one validator is registered per topic kind during an explicit
//! startup phase; the table is immutable once built, so lookups need no
//! locking. The validator is re-evaluated on every (re)subscribe, never
//! cached, so a revoked permission takes effect on the next
//! reconnect/resubscribe without a separate invalidation channel.

use crate::connection::Connection;
use crate::topic::{ResourceId, Topic};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Context handed to a validator.
#[derive(Clone)]
pub struct ValidatorContext {
    /// The connection requesting the subscription.
    pub connection: Arc<Connection>,
    /// The topic being subscribed to.
    pub topic: Topic,
    /// The resource instance being subscribed to.
    pub resource: ResourceId,
}

/// An authorization predicate for one topic kind.
///
/// An `Err` result is treated as a denial; authorization failures must
/// never crash the dispatch loop.
pub type ValidatorFn =
    Arc<dyn Fn(ValidatorContext) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Startup configuration errors. Fatal; the process must not begin
/// accepting connections with an inconsistent registry.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A second validator was registered for the same topic.
    #[error("Validator already registered for topic: {0}")]
    DuplicateValidator(Topic),
}

/// Errors from [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// No validator registered for the topic.
    #[error("No validator registered for topic: {0}")]
    UnknownTopic(Topic),

    /// The validator denied the subscription. Deliberately carries no
    /// resource-identifying detail.
    #[error("Subscription denied")]
    Denied,

    /// The connection holds too many subscriptions.
    #[error("Maximum subscriptions reached")]
    SubscriptionLimit,
}

/// Builder for the validator table.
///
/// Populated by an explicit startup phase iterating a declared list of
/// (topic, validator) pairs, then frozen with [`RegistryBuilder::build`].
pub struct RegistryBuilder {
    validators: HashMap<Topic, ValidatorFn>,
    max_subscriptions: usize,
}

impl RegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
            max_subscriptions: 100,
        }
    }

    /// Cap the number of subscriptions a single connection may hold.
    #[must_use]
    pub fn max_subscriptions(mut self, limit: usize) -> Self {
        self.max_subscriptions = limit;
        self
    }

    /// Register the validator for a topic.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DuplicateValidator`] if the topic
    /// already has one.
    pub fn validator<F, Fut>(mut self, topic: Topic, f: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(ValidatorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        if self.validators.contains_key(&topic) {
            return Err(ConfigurationError::DuplicateValidator(topic));
        }
        self.validators
            .insert(topic, Arc::new(move |ctx| Box::pin(f(ctx))));
        Ok(self)
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> SubscriptionRegistry {
        debug!(validators = self.validators.len(), "Subscription registry built");
        SubscriptionRegistry {
            validators: self.validators,
            max_subscriptions: self.max_subscriptions,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen validator table. Read-only after startup.
pub struct SubscriptionRegistry {
    validators: HashMap<Topic, ValidatorFn>,
    max_subscriptions: usize,
}

impl SubscriptionRegistry {
    /// Evaluate the topic's validator and, on success, add the
    /// (topic, resource) pair to the connection's subscription set.
    ///
    /// Re-subscribing to an already-held pair is a no-op success.
    ///
    /// # Errors
    ///
    /// [`SubscribeError::UnknownTopic`] if the topic has no validator,
    /// [`SubscribeError::Denied`] if the validator refused or failed,
    /// [`SubscribeError::SubscriptionLimit`] if the connection is at cap.
    pub async fn subscribe(
        &self,
        connection: &Arc<Connection>,
        topic: Topic,
        resource: ResourceId,
    ) -> Result<(), SubscribeError> {
        let validator = self
            .validators
            .get(&topic)
            .ok_or(SubscribeError::UnknownTopic(topic))?;

        if !connection.has_subscription(topic, &resource)
            && connection.subscription_count() >= self.max_subscriptions
        {
            return Err(SubscribeError::SubscriptionLimit);
        }

        let ctx = ValidatorContext {
            connection: Arc::clone(connection),
            topic,
            resource: resource.clone(),
        };

        let allowed = match validator(ctx).await {
            Ok(allowed) => allowed,
            Err(error) => {
                warn!(
                    connection = %connection.id(),
                    topic = %topic,
                    error = %error,
                    "Validator failed, denying subscription"
                );
                false
            }
        };

        if !allowed {
            debug!(connection = %connection.id(), topic = %topic, "Subscription denied");
            return Err(SubscribeError::Denied);
        }

        connection.add_subscription(topic, resource);
        Ok(())
    }

    /// Remove the (topic, resource) pair from the connection's set.
    ///
    /// Always succeeds; leaving a topic needs no authorization.
    pub fn unsubscribe(&self, connection: &Arc<Connection>, topic: Topic, resource: &ResourceId) {
        connection.remove_subscription(topic, resource);
    }

    /// The topics with a registered validator.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.validators.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn conn(user_id: &str) -> Arc<Connection> {
        Connection::new(format!("conn-{user_id}"), Identity::user(user_id), 8).0
    }

    fn allow_all() -> RegistryBuilder {
        RegistryBuilder::new()
            .validator(Topic::Board, |_ctx| async { Ok(true) })
            .unwrap()
    }

    #[test]
    fn test_duplicate_validator_is_fatal() {
        let result = allow_all().validator(Topic::Board, |_ctx| async { Ok(true) });
        assert!(matches!(
            result,
            Err(ConfigurationError::DuplicateValidator(Topic::Board))
        ));
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let registry = allow_all().build();
        let c = conn("u-1");

        assert!(matches!(
            registry.subscribe(&c, Topic::Global, ResourceId::None).await,
            Err(SubscribeError::UnknownTopic(Topic::Global))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_allowed_and_denied() {
        let registry = RegistryBuilder::new()
            .validator(Topic::Board, |ctx| async move {
                Ok(ctx.resource.id() == Some("42"))
            })
            .unwrap()
            .build();
        let c = conn("u-1");

        registry
            .subscribe(&c, Topic::Board, ResourceId::Id("42".to_string()))
            .await
            .unwrap();
        assert!(c.has_subscription(Topic::Board, &ResourceId::Id("42".to_string())));

        let denied = registry
            .subscribe(&c, Topic::Board, ResourceId::Id("99".to_string()))
            .await;
        assert!(matches!(denied, Err(SubscribeError::Denied)));
        assert!(!c.has_subscription(Topic::Board, &ResourceId::Id("99".to_string())));
    }

    #[tokio::test]
    async fn test_validator_error_is_denial() {
        let registry = RegistryBuilder::new()
            .validator(Topic::Board, |_ctx| async {
                Err(anyhow::anyhow!("data layer unavailable"))
            })
            .unwrap()
            .build();
        let c = conn("u-1");

        let result = registry
            .subscribe(&c, Topic::Board, ResourceId::Id("42".to_string()))
            .await;
        assert!(matches!(result, Err(SubscribeError::Denied)));
    }

    #[tokio::test]
    async fn test_validator_consulted_on_every_subscribe() {
        let flag = Arc::new(AtomicBool::new(true));
        let check = Arc::clone(&flag);
        let registry = RegistryBuilder::new()
            .validator(Topic::Board, move |_ctx| {
                let check = Arc::clone(&check);
                async move { Ok(check.load(Ordering::SeqCst)) }
            })
            .unwrap()
            .build();

        let c = conn("u-1");
        let r = ResourceId::Id("42".to_string());

        registry.subscribe(&c, Topic::Board, r.clone()).await.unwrap();
        registry.unsubscribe(&c, Topic::Board, &r);

        // Flip the authorization answer; the next subscribe must see it
        flag.store(false, Ordering::SeqCst);
        assert!(matches!(
            registry.subscribe(&c, Topic::Board, r).await,
            Err(SubscribeError::Denied)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let registry = allow_all().build();
        let c = conn("u-1");
        let r = ResourceId::Id("42".to_string());

        registry.subscribe(&c, Topic::Board, r.clone()).await.unwrap();
        registry.subscribe(&c, Topic::Board, r.clone()).await.unwrap();
        assert_eq!(c.subscription_count(), 1);

        // One unsubscribe removes it fully, not a count decrement
        registry.unsubscribe(&c, Topic::Board, &r);
        assert_eq!(c.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_unchecked() {
        let registry = allow_all().build();
        let c = conn("u-1");
        let r = ResourceId::Id("42".to_string());

        // Unsubscribing something never held succeeds silently
        registry.unsubscribe(&c, Topic::Board, &r);
        registry.unsubscribe(&c, Topic::Global, &ResourceId::None);
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let registry = allow_all().max_subscriptions(1).build();
        let c = conn("u-1");

        registry
            .subscribe(&c, Topic::Board, ResourceId::Id("1".to_string()))
            .await
            .unwrap();

        // Re-subscribing the held pair stays a no-op success at the cap
        registry
            .subscribe(&c, Topic::Board, ResourceId::Id("1".to_string()))
            .await
            .unwrap();

        let result = registry
            .subscribe(&c, Topic::Board, ResourceId::Id("2".to_string()))
            .await;
        assert!(matches!(result, Err(SubscribeError::SubscriptionLimit)));
    }

    #[tokio::test]
    async fn test_user_private_scenario() {
        let registry = RegistryBuilder::new()
            .validator(Topic::UserPrivate, |ctx| async move {
                Ok(ctx.resource.id() == Some(ctx.connection.identity().user_id.as_str()))
            })
            .unwrap()
            .build();

        let c = conn("U1");
        registry
            .subscribe(&c, Topic::UserPrivate, ResourceId::Id("U1".to_string()))
            .await
            .unwrap();

        let denied = registry
            .subscribe(&c, Topic::UserPrivate, ResourceId::Id("U2".to_string()))
            .await;
        assert!(matches!(denied, Err(SubscribeError::Denied)));
    }
}
