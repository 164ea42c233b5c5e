use crate::domain::{NotifyConfig, NotifyProcess};
use bidwatch_domain::{ChangeFeedSource, CheckpointStore, NotificationDispatcher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Worker module wiring the notify pipeline's collaborators into a runner
/// process.
pub struct NotifyWorker {
    config: NotifyConfig,
    source: Arc<dyn ChangeFeedSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl NotifyWorker {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: NotifyConfig,
    ) -> Self {
        debug!("initializing notify worker module");
        Self {
            config,
            source,
            checkpoints,
            dispatcher,
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new({
            let config = self.config;
            let source = self.source;
            let checkpoints = self.checkpoints;
            let dispatcher = self.dispatcher;
            move |ctx| {
                let process = NotifyProcess::new(config, source, checkpoints, dispatcher, ctx);
                Box::pin(async move { process.run().await })
            }
        })
    }
}
