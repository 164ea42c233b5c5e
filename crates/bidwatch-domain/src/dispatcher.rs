use crate::error::DomainResult;
use async_trait::async_trait;

/// One-way notification trigger invoked once per change event.
///
/// Calls fail independently; the consumer loop logs failures and moves on,
/// so delivery is at-least-once with an accepted loss margin when the
/// downstream does not retry internally.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn trigger(
        &self,
        workflow_id: &str,
        recipient: &str,
        payload: &serde_json::Value,
    ) -> DomainResult<()>;
}
