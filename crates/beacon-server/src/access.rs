//! Static implementations of the external authorization collaborators.
//!
//! Production deployments back these with the data layer; here the
//! tables come straight from configuration, which is also what the test
//! suites use.

use crate::config::AuthConfig;
use async_trait::async_trait;
use beacon_core::{AccessControl, Identity};
use std::collections::HashMap;

/// Access checks backed by the static config tables.
pub struct StaticAccessControl {
    /// user id -> accessible resource ids.
    assignments: HashMap<String, Vec<String>>,
    /// user id -> "resource:action" grants.
    grants: HashMap<String, Vec<String>>,
}

impl StaticAccessControl {
    /// Build from the auth section of the config.
    #[must_use]
    pub fn new(auth: &AuthConfig) -> Self {
        Self {
            assignments: auth.assignments.clone(),
            grants: auth.grants.clone(),
        }
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn is_assigned(&self, user_id: &str, resource_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .assignments
            .get(user_id)
            .is_some_and(|resources| resources.iter().any(|r| r == resource_id)))
    }

    async fn is_granted(
        &self,
        user_id: &str,
        resource_id: &str,
        action: &str,
    ) -> anyhow::Result<bool> {
        let wanted = format!("{resource_id}:{action}");
        Ok(self
            .grants
            .get(user_id)
            .is_some_and(|grants| grants.iter().any(|g| *g == wanted)))
    }
}

/// Token-to-identity lookup backed by the static config table.
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    /// Build from the auth section of the config.
    #[must_use]
    pub fn new(auth: &AuthConfig) -> Self {
        let tokens = auth
            .tokens
            .iter()
            .map(|(token, entry)| {
                let identity = if entry.bot {
                    Identity::bot(&entry.user_id)
                } else {
                    Identity::user(&entry.user_id)
                };
                (token.clone(), identity)
            })
            .collect();
        Self { tokens }
    }

    /// Resolve a bearer token presented at handshake.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityEntry;

    fn auth() -> AuthConfig {
        AuthConfig {
            tokens: HashMap::from([(
                "secret-1".to_string(),
                IdentityEntry {
                    user_id: "U1".to_string(),
                    bot: false,
                },
            )]),
            assignments: HashMap::from([("U1".to_string(), vec!["42".to_string()])]),
            grants: HashMap::from([(
                "U1".to_string(),
                vec!["app-settings:read".to_string()],
            )]),
        }
    }

    #[tokio::test]
    async fn test_is_assigned() {
        let access = StaticAccessControl::new(&auth());
        assert!(access.is_assigned("U1", "42").await.unwrap());
        assert!(!access.is_assigned("U1", "99").await.unwrap());
        assert!(!access.is_assigned("U2", "42").await.unwrap());
    }

    #[tokio::test]
    async fn test_is_granted() {
        let access = StaticAccessControl::new(&auth());
        assert!(access.is_granted("U1", "app-settings", "read").await.unwrap());
        assert!(!access.is_granted("U1", "app-settings", "write").await.unwrap());
        assert!(!access.is_granted("U2", "app-settings", "read").await.unwrap());
    }

    #[test]
    fn test_authenticate() {
        let identities = StaticIdentityProvider::new(&auth());
        let identity = identities.authenticate("secret-1").unwrap();
        assert_eq!(identity.user_id, "U1");
        assert!(!identity.bot);
        assert!(identities.authenticate("wrong").is_none());
    }
}
