use crate::change_event::{ChangeEvent, Timestamp};
use crate::error::DomainResult;
use async_trait::async_trait;

/// An ordered, timestamp-tagged stream of row-level change events.
///
/// Implementations must deliver events in non-decreasing `ts` order across
/// polls, and the resume point is inclusive-safe: resuming from a
/// previously checkpointed `ts` may redeliver events carrying exactly that
/// `ts`. That redelivery is the designed at-least-once boundary.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Opens a consume session. `None` means "from the beginning" as the
    /// feed defines it.
    async fn subscribe(
        &self,
        resume_from: Option<Timestamp>,
    ) -> DomainResult<Box<dyn FeedSession>>;
}

/// One open subscription on the change feed.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FeedSession: Send {
    /// Returns the currently available events without blocking. An empty
    /// batch is the feed's "no more events currently available" signal.
    async fn poll(&mut self) -> DomainResult<Vec<ChangeEvent>>;

    /// Closes the subscription.
    async fn close(&mut self) -> DomainResult<()>;
}
