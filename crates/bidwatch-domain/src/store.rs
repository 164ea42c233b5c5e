use crate::change_event::Timestamp;
use crate::error::DomainResult;
use async_trait::async_trait;

/// Durable mapping from subscription name to the last fully processed
/// logical timestamp.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_latest(&self, subscription: &str) -> DomainResult<Option<Timestamp>>;

    /// Atomically replaces the checkpoint for `subscription`. A concurrent
    /// reader must never observe the prior checkpoint deleted with the new
    /// one absent.
    async fn replace(&self, subscription: &str, ts: Timestamp) -> DomainResult<()>;
}
