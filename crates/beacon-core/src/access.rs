//! External authorization collaborators.
//!
//! The core never inspects the data layer directly; validators and
//! handlers consult it through this narrow boundary and treat the
//! answers as opaque booleans.

use async_trait::async_trait;

/// Access checks backed by the external data layer.
///
/// Implementations live outside this crate (ORM, HTTP service, static
/// tables in tests). Errors are the caller's concern; validators treat a
/// failed check as a denial.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Is this user permitted access to this resource at all.
    async fn is_assigned(&self, user_id: &str, resource_id: &str) -> anyhow::Result<bool>;

    /// Fine-grained permission check for a specific action on a resource.
    async fn is_granted(
        &self,
        user_id: &str,
        resource_id: &str,
        action: &str,
    ) -> anyhow::Result<bool>;
}
