use bidwatch_domain::{ConsumerLoopConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Logical consumer name; keys the checkpoint row.
    pub subscription_name: String,
    /// Notification workflow triggered once per change event.
    pub workflow_id: String,

    // Polling
    pub poll_interval_ms: u64,
    pub resume_on_restart: bool,

    // Retry
    pub retry_min_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub max_retry_attempts: u32,
}

impl NotifyConfig {
    pub fn consumer_loop_config(&self) -> ConsumerLoopConfig {
        ConsumerLoopConfig {
            subscription: self.subscription_name.clone(),
            workflow_id: self.workflow_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            resume_on_restart: self.resume_on_restart,
            retry: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            min_backoff: Duration::from_millis(self.retry_min_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }
}
