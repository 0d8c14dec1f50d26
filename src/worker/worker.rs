//! Per-assignment polling loop.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::config::WorkerConfig;
use crate::dedup::Deduplicator;
use crate::error::GatewayError;
use crate::gateway::{BOT_TAG_PREFIX, MessageGateway};
use crate::handler::{BotHandler, HandlerVerdict};
use crate::retry;
use crate::store::Store;
use crate::types::{Assignment, MessageId};
use crate::worker::state::{WorkerRecord, WorkerState};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub gateway: Arc<dyn MessageGateway>,
    pub store: Arc<dyn Store>,
    pub dedup: Arc<Deduplicator>,
    pub config: WorkerConfig,
}

/// The polling loop for a single assignment. The supervisor owns the
/// record and the stop channel; the worker mutates the record as it runs.
pub(crate) struct Worker {
    assignment: Assignment,
    handler: Arc<dyn BotHandler>,
    record: Arc<RwLock<WorkerRecord>>,
    deps: WorkerDeps,
}

impl Worker {
    pub(crate) fn new(
        assignment: Assignment,
        handler: Arc<dyn BotHandler>,
        record: Arc<RwLock<WorkerRecord>>,
        deps: WorkerDeps,
    ) -> Self {
        Self {
            assignment,
            handler,
            record,
            deps,
        }
    }

    /// Run until stopped or failed. Cancellation is cooperative: the stop
    /// flag is observed at the top of each iteration and inside the
    /// inter-poll sleep.
    pub(crate) async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let bot = self.assignment.bot.clone();
        let channel = self.assignment.channel.clone();
        let id = self.assignment.id;

        // Starting -> Running, unless a stop request won the race.
        {
            let mut rec = self.record.write().await;
            if rec.state == WorkerState::Stopping {
                let _ = rec.transition_to(WorkerState::Stopped);
                return;
            }
            if let Err(e) = rec.transition_to(WorkerState::Running) {
                tracing::error!(assignment_id = %id, error = %e, "worker could not start");
                return;
            }
        }
        tracing::info!(assignment_id = %id, bot = %bot, channel = %channel, "worker running");

        // Fetch watermark: the dedup cursor, advanced past everything seen
        // this session so rejected bot-tagged messages are not refetched
        // every poll.
        let mut since: Option<MessageId> = self.deps.dedup.cursor(&bot, &channel).await;
        let mut delay = self.deps.config.poll_interval;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            delay = self.deps.config.poll_interval;

            let fetched = tokio::time::timeout(
                self.deps.config.gateway_timeout,
                self.deps.gateway.fetch(&channel, since),
            )
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::transient(format!(
                    "fetch timed out after {:?}",
                    self.deps.config.gateway_timeout
                )))
            });

            let messages = match fetched {
                Ok(messages) => {
                    let mut rec = self.record.write().await;
                    rec.consecutive_failures = 0;
                    messages
                }
                Err(GatewayError::Fatal { reason }) => {
                    tracing::error!(
                        assignment_id = %id,
                        channel = %channel,
                        error = %reason,
                        "fatal gateway error, worker failed"
                    );
                    let mut rec = self.record.write().await;
                    rec.last_error = Some(reason);
                    let _ = rec.transition_to(WorkerState::Failed);
                    return;
                }
                Err(GatewayError::Transient { reason }) => {
                    let failures = {
                        let mut rec = self.record.write().await;
                        rec.consecutive_failures += 1;
                        rec.last_error = Some(reason.clone());
                        rec.consecutive_failures
                    };
                    if failures >= self.deps.config.max_consecutive_failures {
                        tracing::error!(
                            assignment_id = %id,
                            channel = %channel,
                            failures,
                            error = %reason,
                            "worker failed after consecutive fetch failures"
                        );
                        let mut rec = self.record.write().await;
                        let _ = rec.transition_to(WorkerState::Failed);
                        return;
                    }
                    delay = self.deps.config.backoff.delay(failures - 1);
                    tracing::warn!(
                        assignment_id = %id,
                        channel = %channel,
                        failures,
                        retry_in = ?delay,
                        error = %reason,
                        "transient fetch failure"
                    );
                    continue;
                }
            };

            self.process_batch(&messages, &mut since).await;
        }

        // Cooperative stop.
        let mut rec = self.record.write().await;
        if rec.state != WorkerState::Stopping {
            let _ = rec.transition_to(WorkerState::Stopping);
        }
        let _ = rec.transition_to(WorkerState::Stopped);
        tracing::info!(assignment_id = %id, "worker stopped");
    }

    /// Handle one fetched batch in channel-native order.
    async fn process_batch(
        &self,
        messages: &[crate::gateway::Message],
        since: &mut Option<MessageId>,
    ) {
        let bot = &self.assignment.bot;
        let channel = &self.assignment.channel;
        let mut last_accepted_at = None;

        for message in messages {
            *since = Some(since.map_or(message.id, |s| s.max(message.id)));

            if !self.deps.dedup.accept(bot, channel, message).await {
                continue;
            }
            last_accepted_at = Some(message.timestamp);

            {
                let mut rec = self.record.write().await;
                rec.messages_handled += 1;
                rec.last_message_at = Some(message.timestamp);
                rec.cursor = Some(message.id);
            }

            match self
                .handler
                .process(message, &self.assignment.config_override)
                .await
            {
                Ok(HandlerVerdict::Skip) => {
                    tracing::debug!(
                        assignment_id = %self.assignment.id,
                        message_id = message.id,
                        "handler skipped message"
                    );
                }
                Ok(HandlerVerdict::Reply(text)) => {
                    let tag = format!("{BOT_TAG_PREFIX}{bot}");
                    let sent = retry::send_with_retry(
                        self.deps.gateway.as_ref(),
                        channel,
                        &text,
                        &tag,
                        &self.deps.config.backoff,
                        self.deps.config.send_retry_attempts,
                        self.deps.config.gateway_timeout,
                    )
                    .await;
                    match sent {
                        Ok(_) => {
                            self.record.write().await.replies_sent += 1;
                        }
                        Err(e) => {
                            // Bounded retries exhausted: drop this reply,
                            // the worker itself keeps going.
                            tracing::warn!(
                                assignment_id = %self.assignment.id,
                                message_id = message.id,
                                error = %e,
                                "dropping reply after send retries"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        assignment_id = %self.assignment.id,
                        message_id = message.id,
                        error = %e,
                        "handler error, message skipped"
                    );
                }
            }
        }

        // Best-effort activity record for the metrics collaborator.
        if let Some(at) = last_accepted_at {
            if let Err(e) = self.deps.store.record_activity(channel, at).await {
                tracing::debug!(channel = %channel, error = %e, "failed to record activity");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::gateway::Message;
    use crate::handler::EchoHandler;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use crate::types::ChannelId;

    /// Gateway whose fetches follow a script of results.
    struct ScriptedFetch {
        script: Mutex<Vec<Result<Vec<Message>, GatewayError>>>,
        fetches: AtomicU32,
    }

    impl ScriptedFetch {
        fn new(script: Vec<Result<Vec<Message>, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(script),
                fetches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageGateway for ScriptedFetch {
        async fn fetch(
            &self,
            _channel: &ChannelId,
            _since: Option<MessageId>,
        ) -> Result<Vec<Message>, GatewayError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            if script.is_empty() {
                Ok(Vec::new())
            } else {
                script.remove(0)
            }
        }

        async fn send(
            &self,
            _channel: &ChannelId,
            _content: &str,
            _sender_tag: &str,
        ) -> Result<MessageId, GatewayError> {
            Ok(1)
        }
    }

    fn fast_config(failure_cap: u32) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            gateway_timeout: Duration::from_secs(1),
            max_consecutive_failures: failure_cap,
            backoff: Backoff {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
                jitter: 0.0,
            },
            send_retry_attempts: 2,
            stop_timeout: Duration::from_secs(1),
        }
    }

    fn spawn_worker(
        gateway: Arc<dyn MessageGateway>,
        config: WorkerConfig,
    ) -> (Arc<RwLock<WorkerRecord>>, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new());
        let assignment = Assignment::new("bot1", "chat", "echo");
        let mut record = WorkerRecord::new(assignment.id);
        record.transition_to(WorkerState::Starting).unwrap();
        let record = Arc::new(RwLock::new(record));

        let deps = WorkerDeps {
            gateway,
            store: store.clone(),
            dedup: Arc::new(Deduplicator::new(store)),
            config,
        };
        let worker = Worker::new(assignment, Arc::new(EchoHandler), record.clone(), deps);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(worker.run(stop_rx));
        (record, stop_tx)
    }

    async fn wait_for_state(
        record: &Arc<RwLock<WorkerRecord>>,
        target: WorkerState,
    ) -> WorkerRecord {
        for _ in 0..500 {
            {
                let rec = record.read().await;
                if rec.state == target {
                    return rec.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never reached {target}");
    }

    #[tokio::test]
    async fn fails_exactly_at_consecutive_failure_cap() {
        let gateway = Arc::new(ScriptedFetch::new(vec![
            Err(GatewayError::transient("outage")),
            Err(GatewayError::transient("outage")),
            Err(GatewayError::transient("outage")),
            // Never reached: the worker must fail at exactly 3.
            Ok(Vec::new()),
        ]));
        let (record, _stop) = spawn_worker(gateway.clone(), fast_config(3));

        let rec = wait_for_state(&record, WorkerState::Failed).await;
        assert_eq!(rec.consecutive_failures, 3);
        assert!(rec.last_error.as_deref().unwrap().contains("outage"));
        assert_eq!(gateway.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_fetch_resets_failure_counter() {
        let gateway = Arc::new(ScriptedFetch::new(vec![
            Err(GatewayError::transient("blip")),
            Err(GatewayError::transient("blip")),
            Ok(Vec::new()),
        ]));
        let (record, stop) = spawn_worker(gateway.clone(), fast_config(3));

        // Wait until the recovery fetch happened, then check the counter.
        for _ in 0..500 {
            if gateway.fetches.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let rec = record.read().await.clone();
        assert_eq!(rec.state, WorkerState::Running);
        assert_eq!(rec.consecutive_failures, 0);

        stop.send(true).unwrap();
        wait_for_state(&record, WorkerState::Stopped).await;
    }

    #[tokio::test]
    async fn fatal_fetch_fails_immediately() {
        let gateway = Arc::new(ScriptedFetch::new(vec![Err(GatewayError::fatal(
            "channel deleted",
        ))]));
        let (record, _stop) = spawn_worker(gateway, fast_config(5));

        let rec = wait_for_state(&record, WorkerState::Failed).await;
        assert_eq!(rec.consecutive_failures, 0);
        assert!(rec.last_error.as_deref().unwrap().contains("channel deleted"));
    }

    #[tokio::test]
    async fn stop_cancels_long_poll_sleep() {
        let gateway = Arc::new(ScriptedFetch::new(vec![]));
        let mut config = fast_config(5);
        // Far longer than the test timeout; stop must interrupt it.
        config.poll_interval = Duration::from_secs(3600);
        let (record, stop) = spawn_worker(gateway, config);

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();

        let done = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_state(&record, WorkerState::Stopped),
        )
        .await;
        assert!(done.is_ok(), "stop did not cancel the sleep");
    }
}
