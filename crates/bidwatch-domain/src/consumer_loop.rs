use crate::checkpoint::CheckpointCoordinator;
use crate::dispatcher::NotificationDispatcher;
use crate::error::{DomainError, DomainResult};
use crate::feed::{ChangeFeedSource, FeedSession};
use crate::group::{Group, GroupAccumulator};
use crate::retry::RetryPolicy;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer loop states. `Failed` is terminal; `ShuttingDown` is reachable
/// from any point via the cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Subscribing,
    Polling,
    Dispatching,
    Checkpointing,
    ShuttingDown,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Initializing => "initializing",
            LoopState::Subscribing => "subscribing",
            LoopState::Polling => "polling",
            LoopState::Dispatching => "dispatching",
            LoopState::Checkpointing => "checkpointing",
            LoopState::ShuttingDown => "shutting_down",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Settings for one consumer loop instance.
#[derive(Debug, Clone)]
pub struct ConsumerLoopConfig {
    /// Logical consumer name; keys the checkpoint row.
    pub subscription: String,
    /// Notification workflow triggered once per event.
    pub workflow_id: String,
    /// Cooperative wait between polls when the feed has nothing available.
    pub poll_interval: Duration,
    /// When false, any stored checkpoint is ignored and consumption starts
    /// from the beginning as the feed defines it.
    pub resume_on_restart: bool,
    /// Bounds re-subscription after transient feed failures.
    pub retry: RetryPolicy,
}

impl Default for ConsumerLoopConfig {
    fn default() -> Self {
        Self {
            subscription: "notify_winners".to_string(),
            workflow_id: "winning-bid-alert".to_string(),
            poll_interval: Duration::from_secs(1),
            resume_on_restart: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// The single sequential worker for one subscription.
///
/// Polls the change feed, groups events by logical timestamp, dispatches
/// each completed group and persists the watermark before polling on.
/// Groups are processed strictly in `ts` order; dispatch and checkpointing
/// for one group never overlap with the next.
pub struct ConsumerLoop {
    source: Arc<dyn ChangeFeedSource>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    checkpoints: CheckpointCoordinator,
    config: ConsumerLoopConfig,
    shutdown: CancellationToken,
    state: LoopState,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        checkpoints: CheckpointCoordinator,
        config: ConsumerLoopConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            dispatcher,
            checkpoints,
            config,
            shutdown,
            state: LoopState::Initializing,
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "consumer loop state change");
            self.state = next;
        }
    }

    /// Drives the loop until shutdown or a fatal error.
    ///
    /// Cancellation interrupts the poll wait immediately but never an
    /// in-flight dispatch/checkpoint pair, so the watermark always reflects
    /// a fully dispatched group. A partial group open at shutdown is
    /// discarded and re-observed from the checkpoint on the next start.
    pub async fn run(mut self) -> DomainResult<()> {
        match self.drive().await {
            Ok(()) => {
                info!(subscription = %self.config.subscription, "consumer loop stopped");
                Ok(())
            }
            Err(e) => {
                self.transition(LoopState::Failed);
                error!(
                    subscription = %self.config.subscription,
                    error = %e,
                    "consumer loop failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> DomainResult<()> {
        self.transition(LoopState::Subscribing);
        let resume = if self.config.resume_on_restart {
            self.checkpoints.resume_point().await?
        } else {
            debug!("resume disabled, consuming from the beginning");
            None
        };
        let mut session = self.source.subscribe(resume).await?;
        info!(
            subscription = %self.config.subscription,
            resume = ?resume,
            "subscribed to change feed"
        );

        let outcome = self.poll_loop(&mut session).await;

        if outcome.is_ok() {
            self.transition(LoopState::ShuttingDown);
        }
        if let Err(e) = session.close().await {
            warn!(error = %e, "failed to close feed session");
        }
        outcome
    }

    async fn poll_loop(&mut self, session: &mut Box<dyn FeedSession>) -> DomainResult<()> {
        let mut accumulator = GroupAccumulator::new();
        let mut feed_failures = 0u32;

        loop {
            self.transition(LoopState::Polling);
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                polled = session.poll() => polled,
            };

            match polled {
                Ok(events) if events.is_empty() => {
                    feed_failures = 0;
                    if let Some(group) = accumulator.flush_if_nonempty() {
                        debug!(ts = group.ts(), "idle poll closed the open group");
                        self.deliver(&group).await?;
                        self.transition(LoopState::Polling);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(events) => {
                    feed_failures = 0;
                    debug!(count = events.len(), "received change events");
                    for event in events {
                        if let Some(group) = accumulator.observe(event)? {
                            self.deliver(&group).await?;
                            self.transition(LoopState::Polling);
                        }
                    }
                }
                Err(DomainError::Feed(e)) => {
                    feed_failures += 1;
                    if feed_failures >= self.config.retry.max_attempts {
                        return Err(DomainError::RetriesExhausted {
                            operation: "change feed poll",
                            attempts: feed_failures,
                            source: e,
                        });
                    }
                    let backoff = self.config.retry.backoff(feed_failures);
                    warn!(
                        error = %e,
                        attempt = feed_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient feed failure, re-subscribing"
                    );
                    // The partial group will be redelivered from the
                    // committed watermark after re-subscription.
                    accumulator.reset();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.transition(LoopState::Subscribing);
                    match self.source.subscribe(self.checkpoints.committed()).await {
                        Ok(new_session) => {
                            *session = new_session;
                            info!(
                                resume = ?self.checkpoints.committed(),
                                "re-subscribed after feed failure"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "re-subscription failed, will retry");
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Dispatches every event of a completed group, then persists the
    /// group's timestamp as the new watermark.
    async fn deliver(&mut self, group: &Group) -> DomainResult<()> {
        self.transition(LoopState::Dispatching);
        info!(ts = group.ts(), events = group.len(), "dispatching group");

        let workflow_id = self.config.workflow_id.as_str();
        let dispatcher = &self.dispatcher;
        let results = join_all(group.events().iter().map(|event| async move {
            dispatcher
                .trigger(workflow_id, &event.recipient, &event.fields)
                .await
                .map_err(|e| (event.id.clone(), e))
        }))
        .await;

        let mut failed = 0usize;
        for result in results {
            if let Err((event_id, e)) = result {
                failed += 1;
                warn!(
                    event_id = %event_id,
                    error = %e,
                    "notification dispatch failed, skipping event"
                );
            }
        }
        if failed > 0 {
            warn!(
                ts = group.ts(),
                failed,
                total = group.len(),
                "group dispatched with failures"
            );
        }

        self.transition(LoopState::Checkpointing);
        self.checkpoints.commit(group.ts()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::{ChangeEvent, Timestamp};
    use crate::dispatcher::MockNotificationDispatcher;
    use crate::store::MockCheckpointStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use mockall::Sequence;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn event(id: &str, ts: Timestamp) -> ChangeEvent {
        ChangeEvent {
            id: id.to_string(),
            ts,
            recipient: format!("buyer-{id}"),
            fields: serde_json::json!({ "id": id, "item": "vintage radio" }),
        }
    }

    fn fast_config() -> ConsumerLoopConfig {
        ConsumerLoopConfig {
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                max_attempts: 3,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            ..ConsumerLoopConfig::default()
        }
    }

    /// What a scripted session does once its batches run out.
    enum OnExhausted {
        /// Cancel the loop's token and report an idle poll, so the test
        /// drains deterministically.
        CancelAndIdle(CancellationToken),
        /// Park forever, letting the test cancel externally mid-poll.
        Hang,
    }

    struct ScriptedSession {
        batches: VecDeque<DomainResult<Vec<ChangeEvent>>>,
        on_exhausted: OnExhausted,
    }

    #[async_trait]
    impl FeedSession for ScriptedSession {
        async fn poll(&mut self) -> DomainResult<Vec<ChangeEvent>> {
            match self.batches.pop_front() {
                Some(batch) => batch,
                None => match &self.on_exhausted {
                    OnExhausted::CancelAndIdle(token) => {
                        token.cancel();
                        Ok(Vec::new())
                    }
                    OnExhausted::Hang => std::future::pending().await,
                },
            }
        }

        async fn close(&mut self) -> DomainResult<()> {
            Ok(())
        }
    }

    struct ScriptedSource {
        sessions: Mutex<VecDeque<ScriptedSession>>,
        subscribed_with: Mutex<Vec<Option<Timestamp>>>,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<ScriptedSession>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                subscribed_with: Mutex::new(Vec::new()),
            }
        }

        fn resume_points(&self) -> Vec<Option<Timestamp>> {
            self.subscribed_with.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeFeedSource for ScriptedSource {
        async fn subscribe(
            &self,
            resume_from: Option<Timestamp>,
        ) -> DomainResult<Box<dyn FeedSession>> {
            self.subscribed_with.lock().unwrap().push(resume_from);
            match self.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok(Box::new(session)),
                None => Err(DomainError::Feed(anyhow!("no session scripted"))),
            }
        }
    }

    fn coordinator(store: MockCheckpointStore) -> CheckpointCoordinator {
        CheckpointCoordinator::new(
            Arc::new(store),
            "notify_winners",
            RetryPolicy {
                max_attempts: 3,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn dispatches_groups_in_order_and_checkpoints_each() {
        // Feed delivers A(5), B(5) then C(7), then goes idle: expect
        // Group{A,B} (2 calls) -> checkpoint 5 -> Group{C} (1 call) ->
        // checkpoint 7.
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::from([
                Ok(vec![event("a", 5), event("b", 5)]),
                Ok(vec![event("c", 7)]),
            ]),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);

        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MockNotificationDispatcher::new();
        let seen = Arc::clone(&dispatched);
        dispatcher.expect_trigger().times(3).returning(
            move |workflow, recipient, _payload| {
                assert_eq!(workflow, "winning-bid-alert");
                seen.lock().unwrap().push(recipient.to_string());
                Ok(())
            },
        );

        let mut store = MockCheckpointStore::new();
        let mut seq = Sequence::new();
        store.expect_read_latest().times(1).returning(|_| Ok(None));
        store
            .expect_replace()
            .withf(|_, ts| *ts == 5)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_replace()
            .withf(|_, ts| *ts == 7)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let consumer = ConsumerLoop::new(
            Arc::new(source),
            Arc::new(dispatcher),
            coordinator(store),
            fast_config(),
            token,
        );
        consumer.run().await.unwrap();

        let recipients = dispatched.lock().unwrap().clone();
        assert_eq!(recipients, ["buyer-a", "buyer-b", "buyer-c"]);
    }

    #[tokio::test]
    async fn resumes_from_stored_checkpoint() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::new(),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);
        let source = Arc::new(source);

        let mut store = MockCheckpointStore::new();
        store
            .expect_read_latest()
            .times(1)
            .returning(|_| Ok(Some(7)));
        store.expect_replace().times(0);

        let consumer = ConsumerLoop::new(
            Arc::clone(&source) as Arc<dyn ChangeFeedSource>,
            Arc::new(MockNotificationDispatcher::new()),
            coordinator(store),
            fast_config(),
            token,
        );
        consumer.run().await.unwrap();

        // Restart with an empty feed at checkpoint 7 re-processes nothing.
        assert_eq!(source.resume_points(), [Some(7)]);
    }

    #[tokio::test]
    async fn ignores_checkpoint_when_resume_is_disabled() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::new(),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);
        let source = Arc::new(source);

        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().times(0);

        let config = ConsumerLoopConfig {
            resume_on_restart: false,
            ..fast_config()
        };
        let consumer = ConsumerLoop::new(
            Arc::clone(&source) as Arc<dyn ChangeFeedSource>,
            Arc::new(MockNotificationDispatcher::new()),
            coordinator(store),
            config,
            token,
        );
        consumer.run().await.unwrap();

        assert_eq!(source.resume_points(), [None]);
    }

    #[tokio::test]
    async fn idle_flush_checkpoints_exactly_once() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::from([
                Ok(vec![event("a", 5)]),
                Ok(Vec::new()),
                Ok(Vec::new()),
                Ok(Vec::new()),
            ]),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher.expect_trigger().times(1).returning(|_, _, _| Ok(()));

        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().returning(|_| Ok(None));
        store
            .expect_replace()
            .withf(|_, ts| *ts == 5)
            .times(1)
            .returning(|_, _| Ok(()));

        let consumer = ConsumerLoop::new(
            Arc::new(source),
            Arc::new(dispatcher),
            coordinator(store),
            fast_config(),
            token,
        );
        consumer.run().await.unwrap();
    }

    #[tokio::test]
    async fn one_failing_dispatch_blocks_neither_siblings_nor_checkpoint() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::from([Ok(vec![
                event("a", 5),
                event("b", 5),
                event("c", 5),
            ])]),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher
            .expect_trigger()
            .times(3)
            .returning(|_, recipient, _| {
                if recipient == "buyer-b" {
                    Err(DomainError::Dispatch(anyhow!("novu 500")))
                } else {
                    Ok(())
                }
            });

        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().returning(|_| Ok(None));
        store
            .expect_replace()
            .withf(|_, ts| *ts == 5)
            .times(1)
            .returning(|_, _| Ok(()));

        let consumer = ConsumerLoop::new(
            Arc::new(source),
            Arc::new(dispatcher),
            coordinator(store),
            fast_config(),
            token,
        );
        consumer.run().await.unwrap();
    }

    #[tokio::test]
    async fn timestamp_regression_is_fatal_and_writes_no_checkpoint() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::from([Ok(vec![event("c", 7)]), Ok(vec![event("a", 5)])]),
            on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
        }]);

        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().returning(|_| Ok(None));
        store.expect_replace().times(0);

        let consumer = ConsumerLoop::new(
            Arc::new(source),
            Arc::new(MockNotificationDispatcher::new()),
            coordinator(store),
            fast_config(),
            token,
        );

        let err = consumer.run().await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::StreamOrder {
                current: 7,
                observed: 5
            }
        ));
    }

    #[tokio::test]
    async fn transient_poll_failure_resubscribes_from_committed_watermark() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![
            // First session delivers a partial group, then breaks.
            ScriptedSession {
                batches: VecDeque::from([
                    Ok(vec![event("a", 5)]),
                    Err(DomainError::Feed(anyhow!("connection lost"))),
                ]),
                on_exhausted: OnExhausted::Hang,
            },
            // The replacement session redelivers the discarded group.
            ScriptedSession {
                batches: VecDeque::from([Ok(vec![event("a", 5), event("b", 5)])]),
                on_exhausted: OnExhausted::CancelAndIdle(token.clone()),
            },
        ]);
        let source = Arc::new(source);

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher.expect_trigger().times(2).returning(|_, _, _| Ok(()));

        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().returning(|_| Ok(None));
        store
            .expect_replace()
            .withf(|_, ts| *ts == 5)
            .times(1)
            .returning(|_, _| Ok(()));

        let consumer = ConsumerLoop::new(
            Arc::clone(&source) as Arc<dyn ChangeFeedSource>,
            Arc::new(dispatcher),
            coordinator(store),
            fast_config(),
            token,
        );
        consumer.run().await.unwrap();

        // Nothing was committed before the failure, so the re-subscription
        // starts from the beginning again.
        assert_eq!(source.resume_points(), [None, None]);
    }

    #[tokio::test]
    async fn shutdown_discards_partial_group() {
        let token = CancellationToken::new();
        let source = ScriptedSource::new(vec![ScriptedSession {
            batches: VecDeque::from([Ok(vec![event("a", 5)])]),
            on_exhausted: OnExhausted::Hang,
        }]);

        let mut dispatcher = MockNotificationDispatcher::new();
        dispatcher.expect_trigger().times(0);
        let mut store = MockCheckpointStore::new();
        store.expect_read_latest().returning(|_| Ok(None));
        store.expect_replace().times(0);

        let consumer = ConsumerLoop::new(
            Arc::new(source),
            Arc::new(dispatcher),
            coordinator(store),
            fast_config(),
            token.clone(),
        );

        let handle = tokio::spawn(consumer.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        handle.await.unwrap().unwrap();
    }
}
