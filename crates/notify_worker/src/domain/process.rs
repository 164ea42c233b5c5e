use crate::domain::NotifyConfig;
use anyhow::Result;
use bidwatch_domain::{
    ChangeFeedSource, CheckpointCoordinator, CheckpointStore, ConsumerLoop,
    NotificationDispatcher,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One notify pipeline run: builds the checkpoint coordinator and consumer
/// loop for the configured subscription and drives them until shutdown.
pub struct NotifyProcess {
    config: NotifyConfig,
    source: Arc<dyn ChangeFeedSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    cancellation_token: CancellationToken,
}

impl NotifyProcess {
    pub fn new(
        config: NotifyConfig,
        source: Arc<dyn ChangeFeedSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            checkpoints,
            dispatcher,
            cancellation_token,
        }
    }

    pub async fn run(self) -> Result<()> {
        debug!(
            subscription = %self.config.subscription_name,
            "starting notify process"
        );

        let coordinator = CheckpointCoordinator::new(
            self.checkpoints,
            self.config.subscription_name.clone(),
            self.config.retry_policy(),
        );
        let consumer = ConsumerLoop::new(
            self.source,
            self.dispatcher,
            coordinator,
            self.config.consumer_loop_config(),
            self.cancellation_token,
        );

        consumer.run().await?;
        Ok(())
    }
}
