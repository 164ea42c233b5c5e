use crate::change_event::Timestamp;
use crate::error::{DomainError, DomainResult};
use crate::retry::RetryPolicy;
use crate::store::CheckpointStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns checkpoint reads and writes for a single subscription.
///
/// The watermark is read once at startup to compute the resume point and
/// replaced after every completed group. Writes retry transient store
/// failures with backoff; the watermark never decreases. Rewriting an equal
/// timestamp is allowed, since an inclusive resume redelivers the
/// checkpointed instant.
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    subscription: String,
    retry: RetryPolicy,
    committed: Option<Timestamp>,
}

impl CheckpointCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        subscription: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            subscription: subscription.into(),
            retry,
            committed: None,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Last watermark known to be durably written, if any.
    pub fn committed(&self) -> Option<Timestamp> {
        self.committed
    }

    /// Reads the stored watermark to compute the resume point.
    pub async fn resume_point(&mut self) -> DomainResult<Option<Timestamp>> {
        let stored = self.store.read_latest(&self.subscription).await?;
        self.committed = stored;
        debug!(
            subscription = %self.subscription,
            checkpoint = ?stored,
            "read checkpoint"
        );
        Ok(stored)
    }

    /// Durably replaces the watermark with `ts`, retrying with backoff.
    ///
    /// The caller must not poll the next batch until this returns, so a
    /// completed group can never be silently skipped.
    pub async fn commit(&mut self, ts: Timestamp) -> DomainResult<()> {
        if let Some(committed) = self.committed {
            if ts < committed {
                return Err(DomainError::CheckpointRegression {
                    subscription: self.subscription.clone(),
                    attempted: ts,
                    committed,
                });
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.replace(&self.subscription, ts).await {
                Ok(()) => {
                    self.committed = Some(ts);
                    info!(
                        subscription = %self.subscription,
                        checkpoint = ts,
                        "checkpoint written"
                    );
                    return Ok(());
                }
                Err(DomainError::Store(e)) if attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(DomainError::Store(e)) => {
                    return Err(DomainError::RetriesExhausted {
                        operation: "checkpoint write",
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(other) => return Err(other),
            }
        }
    }
}
