//! Worker lifecycle supervisor.
//!
//! Owns every worker record and join handle. Start/stop are serialized
//! per assignment id; the whole-topology reconcile runs exactly once,
//! before any start or stop is accepted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::dedup::Deduplicator;
use crate::error::SupervisorError;
use crate::gateway::MessageGateway;
use crate::handler::HandlerRegistry;
use crate::store::Store;
use crate::types::{Assignment, AssignmentId, ChannelId};
use crate::worker::state::{WorkerRecord, WorkerState};
use crate::worker::worker::{Worker, WorkerDeps};

/// Tracked worker: shared record, stop signal, and the task handle.
struct WorkerHandle {
    record: Arc<RwLock<WorkerRecord>>,
    channel: ChannelId,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

/// Starts, stops and tracks all workers.
pub struct WorkerSupervisor {
    store: Arc<dyn Store>,
    gateway: Arc<dyn MessageGateway>,
    registry: Arc<HandlerRegistry>,
    dedup: Arc<Deduplicator>,
    config: WorkerConfig,
    workers: RwLock<HashMap<AssignmentId, WorkerHandle>>,
    /// Per-assignment mutexes serializing start/stop/restart.
    locks: Mutex<HashMap<AssignmentId, Arc<Mutex<()>>>>,
    reconciled: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<HandlerRegistry>,
        dedup: Arc<Deduplicator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            dedup,
            config,
            workers: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            reconciled: AtomicBool::new(false),
        }
    }

    fn ensure_reconciled(&self) -> Result<(), SupervisorError> {
        if self.reconciled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SupervisorError::NotReconciled)
        }
    }

    async fn assignment_lock(&self, id: AssignmentId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Boot-time reconcile: start a worker for every assignment whose
    /// persisted RunningState is true, lowest priority number first.
    /// Runs exactly once; returns the started ids in start order.
    pub async fn reconcile(&self) -> Result<Vec<AssignmentId>, SupervisorError> {
        if self.reconciled.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyReconciled);
        }

        let running: HashSet<AssignmentId> = self
            .store
            .load_running_assignments()
            .await?
            .into_iter()
            .collect();
        let mut assignments: Vec<Assignment> = self
            .store
            .load_assignments()
            .await?
            .into_iter()
            .filter(|a| running.contains(&a.id))
            .collect();
        assignments.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.bot.as_str().cmp(b.bot.as_str()))
        });

        let mut started = Vec::new();
        for assignment in assignments {
            if !assignment.enabled {
                tracing::warn!(
                    assignment_id = %assignment.id,
                    "skipping disabled assignment with persisted running state"
                );
                continue;
            }
            let id = assignment.id;
            match self.spawn_worker(assignment).await {
                Ok(()) => started.push(id),
                Err(e) => {
                    tracing::error!(
                        assignment_id = %id,
                        error = %e,
                        "failed to start worker during reconcile"
                    );
                }
            }
        }
        tracing::info!(count = started.len(), "reconcile complete");
        Ok(started)
    }

    /// Start a worker. Idempotent: a no-op when already Starting or
    /// Running. Persists RunningState=true so a later reconcile
    /// reproduces the topology.
    pub async fn start(&self, id: AssignmentId) -> Result<(), SupervisorError> {
        self.ensure_reconciled()?;
        let lock = self.assignment_lock(id).await;
        let _guard = lock.lock().await;

        if let Some(handle) = self.workers.read().await.get(&id) {
            let rec = handle.record.read().await;
            match rec.state {
                WorkerState::Starting | WorkerState::Running => return Ok(()),
                WorkerState::Failed => {
                    return Err(SupervisorError::WorkerFailed {
                        id,
                        reason: rec
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "unknown error".into()),
                    });
                }
                // A self-exited worker left a stale record; respawn.
                WorkerState::Stopping | WorkerState::Stopped => {}
            }
        }

        let assignment = self
            .store
            .get_assignment(id)
            .await?
            .ok_or(SupervisorError::AssignmentNotFound { id })?;
        if !assignment.enabled {
            return Err(SupervisorError::AssignmentDisabled { id });
        }

        self.store.save_running_state(id, true).await?;
        self.spawn_worker(assignment).await
    }

    /// Stop a worker. Idempotent: a no-op when nothing is running, though
    /// the operator's intent is still persisted.
    pub async fn stop(&self, id: AssignmentId) -> Result<(), SupervisorError> {
        self.ensure_reconciled()?;
        self.stop_inner(id, true).await
    }

    /// Explicit restart, the only path out of Failed. Also starts a
    /// worker that is plain stopped; a no-op when already live.
    pub async fn restart(&self, id: AssignmentId) -> Result<(), SupervisorError> {
        self.ensure_reconciled()?;
        let lock = self.assignment_lock(id).await;
        let _guard = lock.lock().await;

        if let Some(handle) = self.workers.read().await.get(&id) {
            let state = handle.record.read().await.state;
            if matches!(state, WorkerState::Starting | WorkerState::Running) {
                return Ok(());
            }
        }
        self.workers.write().await.remove(&id);

        let assignment = self
            .store
            .get_assignment(id)
            .await?
            .ok_or(SupervisorError::AssignmentNotFound { id })?;
        if !assignment.enabled {
            return Err(SupervisorError::AssignmentDisabled { id });
        }

        self.store.save_running_state(id, true).await?;
        self.spawn_worker(assignment).await
    }

    async fn stop_inner(
        &self,
        id: AssignmentId,
        persist_intent: bool,
    ) -> Result<(), SupervisorError> {
        let lock = self.assignment_lock(id).await;
        let _guard = lock.lock().await;

        let handle = self.workers.write().await.remove(&id);
        let Some(mut handle) = handle else {
            if self.store.get_assignment(id).await?.is_none() {
                return Err(SupervisorError::AssignmentNotFound { id });
            }
            if persist_intent {
                self.store.save_running_state(id, false).await?;
            }
            return Ok(());
        };

        let state = handle.record.read().await.state;
        if state.is_live() {
            {
                let mut rec = handle.record.write().await;
                let _ = rec.transition_to(WorkerState::Stopping);
            }
            let _ = handle.stop_tx.send(true);

            if let Some(mut join) = handle.join.take() {
                match tokio::time::timeout(self.config.stop_timeout, &mut join).await {
                    Ok(_) => {}
                    Err(_) => {
                        join.abort();
                        let mut rec = handle.record.write().await;
                        let _ = rec.transition_to(WorkerState::Stopped);
                        tracing::warn!(
                            assignment_id = %id,
                            timeout = ?self.config.stop_timeout,
                            "worker did not stop in time, aborted"
                        );
                        if persist_intent {
                            self.store.save_running_state(id, false).await?;
                        }
                        return Err(SupervisorError::StopTimeout {
                            id,
                            timeout: self.config.stop_timeout,
                        });
                    }
                }
            }
        }

        if persist_intent {
            self.store.save_running_state(id, false).await?;
        }
        tracing::info!(assignment_id = %id, "worker stopped");
        Ok(())
    }

    /// Snapshot of one worker's record. A known assignment without a live
    /// worker reports as Stopped.
    pub async fn status(&self, id: AssignmentId) -> Result<WorkerRecord, SupervisorError> {
        if let Some(handle) = self.workers.read().await.get(&id) {
            return Ok(handle.record.read().await.clone());
        }
        if self.store.get_assignment(id).await?.is_some() {
            Ok(WorkerRecord::new(id))
        } else {
            Err(SupervisorError::AssignmentNotFound { id })
        }
    }

    /// Snapshots of every worker on a channel.
    pub async fn status_for_channel(&self, channel: &ChannelId) -> Vec<WorkerRecord> {
        let workers = self.workers.read().await;
        let mut records = Vec::new();
        for handle in workers.values() {
            if handle.channel == *channel {
                records.push(handle.record.read().await.clone());
            }
        }
        records
    }

    /// Snapshots of all tracked workers.
    pub async fn status_all(&self) -> Vec<WorkerRecord> {
        let workers = self.workers.read().await;
        let mut records = Vec::new();
        for handle in workers.values() {
            records.push(handle.record.read().await.clone());
        }
        records
    }

    /// Stop every worker without touching persisted operator intent, so a
    /// redeploy's reconcile reproduces the same topology.
    pub async fn shutdown(&self) {
        let ids: Vec<AssignmentId> = self.workers.read().await.keys().copied().collect();
        let stops = ids.into_iter().map(|id| self.stop_inner(id, false));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "worker stop during shutdown failed");
            }
        }
    }

    async fn spawn_worker(&self, assignment: Assignment) -> Result<(), SupervisorError> {
        let handler = self.registry.get(&assignment.handler_type).ok_or_else(|| {
            SupervisorError::HandlerNotRegistered {
                handler_type: assignment.handler_type.clone(),
            }
        })?;

        let mut record = WorkerRecord::new(assignment.id);
        // Fresh record: Stopped -> Starting cannot fail.
        let _ = record.transition_to(WorkerState::Starting);
        let record = Arc::new(RwLock::new(record));

        let (stop_tx, stop_rx) = watch::channel(false);
        let deps = WorkerDeps {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            dedup: self.dedup.clone(),
            config: self.config.clone(),
        };
        let worker = Worker::new(assignment.clone(), handler, record.clone(), deps);
        let join = tokio::spawn(worker.run(stop_rx));

        self.workers.write().await.insert(
            assignment.id,
            WorkerHandle {
                record,
                channel: assignment.channel.clone(),
                stop_tx,
                join: Some(join),
            },
        );
        tracing::info!(
            assignment_id = %assignment.id,
            bot = %assignment.bot,
            channel = %assignment.channel,
            "worker started"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{InProcessGateway, Message};
    use crate::handler::EchoHandler;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use crate::types::MessageId;

    /// Gateway whose fetch always fails with a transient error.
    struct DownGateway;

    #[async_trait]
    impl MessageGateway for DownGateway {
        async fn fetch(
            &self,
            _channel: &ChannelId,
            _since: Option<MessageId>,
        ) -> Result<Vec<Message>, GatewayError> {
            Err(GatewayError::transient("connection refused"))
        }

        async fn send(
            &self,
            _channel: &ChannelId,
            _content: &str,
            _sender_tag: &str,
        ) -> Result<MessageId, GatewayError> {
            Err(GatewayError::transient("connection refused"))
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            gateway_timeout: Duration::from_secs(1),
            max_consecutive_failures: 2,
            backoff: Backoff {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
                jitter: 0.0,
            },
            send_retry_attempts: 2,
            stop_timeout: Duration::from_secs(1),
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));
        Arc::new(registry)
    }

    fn supervisor_over(
        store: Arc<MemoryStore>,
        gateway: Arc<dyn MessageGateway>,
    ) -> WorkerSupervisor {
        let dedup = Arc::new(Deduplicator::new(store.clone()));
        WorkerSupervisor::new(store, gateway, registry(), dedup, fast_config())
    }

    async fn seed_assignment(store: &MemoryStore) -> AssignmentId {
        let assignment = Assignment::new("bot1", "chat", "echo");
        let id = assignment.id;
        store.insert_assignment(assignment).await;
        id
    }

    async fn wait_for(supervisor: &WorkerSupervisor, id: AssignmentId, state: WorkerState) {
        for _ in 0..500 {
            if supervisor.status(id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker {id} never reached {state}");
    }

    #[tokio::test]
    async fn start_requires_reconcile_first() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_assignment(&store).await;
        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));

        assert!(matches!(
            supervisor.start(id).await,
            Err(SupervisorError::NotReconciled)
        ));
        supervisor.reconcile().await.unwrap();
        supervisor.start(id).await.unwrap();
        wait_for(&supervisor, id, WorkerState::Running).await;
    }

    #[tokio::test]
    async fn reconcile_runs_only_once() {
        let store = Arc::new(MemoryStore::new());
        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));

        supervisor.reconcile().await.unwrap();
        assert!(matches!(
            supervisor.reconcile().await,
            Err(SupervisorError::AlreadyReconciled)
        ));
    }

    #[tokio::test]
    async fn concurrent_starts_yield_one_running_worker() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_assignment(&store).await;
        let supervisor = Arc::new(supervisor_over(store, Arc::new(InProcessGateway::new())));
        supervisor.reconcile().await.unwrap();

        let (a, b) = tokio::join!(supervisor.start(id), supervisor.start(id));
        a.unwrap();
        b.unwrap();

        wait_for(&supervisor, id, WorkerState::Running).await;
        assert_eq!(supervisor.status_all().await.len(), 1);
    }

    #[tokio::test]
    async fn start_rejects_unknown_and_disabled() {
        let store = Arc::new(MemoryStore::new());
        let mut disabled = Assignment::new("bot1", "chat", "echo");
        disabled.enabled = false;
        let disabled_id = disabled.id;
        store.insert_assignment(disabled).await;

        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));
        supervisor.reconcile().await.unwrap();

        assert!(matches!(
            supervisor.start(uuid::Uuid::new_v4()).await,
            Err(SupervisorError::AssignmentNotFound { .. })
        ));
        assert!(matches!(
            supervisor.start(disabled_id).await,
            Err(SupervisorError::AssignmentDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn running_state_survives_restart_of_supervisor() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_assignment(&store).await;

        // Boot 1: operator starts the worker.
        let supervisor = supervisor_over(store.clone(), Arc::new(InProcessGateway::new()));
        supervisor.reconcile().await.unwrap();
        supervisor.start(id).await.unwrap();
        wait_for(&supervisor, id, WorkerState::Running).await;
        supervisor.shutdown().await;

        // Boot 2: reconcile restores the worker from persisted intent.
        let supervisor = supervisor_over(store.clone(), Arc::new(InProcessGateway::new()));
        let started = supervisor.reconcile().await.unwrap();
        assert_eq!(started, vec![id]);
        wait_for(&supervisor, id, WorkerState::Running).await;

        // Operator stops it; boot 3 must not bring it back.
        supervisor.stop(id).await.unwrap();
        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));
        let started = supervisor.reconcile().await.unwrap();
        assert!(started.is_empty());
        assert_eq!(
            supervisor.status(id).await.unwrap().state,
            WorkerState::Stopped
        );
    }

    #[tokio::test]
    async fn reconcile_starts_in_priority_order() {
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for (bot, priority) in [("late", 7), ("first", 1), ("middle", 3)] {
            let assignment = Assignment::new(bot, "chat", "echo").with_priority(priority);
            ids.push((assignment.id, priority));
            store.save_running_state(assignment.id, true).await.unwrap();
            store.insert_assignment(assignment).await;
        }

        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));
        let started = supervisor.reconcile().await.unwrap();

        ids.sort_by_key(|(_, p)| *p);
        let expected: Vec<AssignmentId> = ids.into_iter().map(|(id, _)| id).collect();
        assert_eq!(started, expected);
    }

    #[tokio::test]
    async fn failed_worker_needs_explicit_restart() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_assignment(&store).await;
        let supervisor = supervisor_over(store, Arc::new(DownGateway));
        supervisor.reconcile().await.unwrap();

        supervisor.start(id).await.unwrap();
        wait_for(&supervisor, id, WorkerState::Failed).await;

        // Plain start refuses; restart goes Failed -> Starting.
        assert!(matches!(
            supervisor.start(id).await,
            Err(SupervisorError::WorkerFailed { .. })
        ));
        supervisor.restart(id).await.unwrap();

        // The gateway is still down, so it fails again, but it ran.
        wait_for(&supervisor, id, WorkerState::Failed).await;
        let rec = supervisor.status(id).await.unwrap();
        assert!(rec.last_error.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let id = seed_assignment(&store).await;
        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));
        supervisor.reconcile().await.unwrap();

        supervisor.start(id).await.unwrap();
        wait_for(&supervisor, id, WorkerState::Running).await;

        supervisor.stop(id).await.unwrap();
        supervisor.stop(id).await.unwrap();
        assert_eq!(
            supervisor.status(id).await.unwrap().state,
            WorkerState::Stopped
        );
    }

    #[tokio::test]
    async fn status_for_channel_lists_all_assigned_workers() {
        let store = Arc::new(MemoryStore::new());
        let a = Assignment::new("bot1", "chat-x", "echo");
        let b = Assignment::new("bot2", "chat-x", "echo");
        let c = Assignment::new("bot3", "chat-y", "echo");
        let (a_id, b_id) = (a.id, b.id);
        for assignment in [a, b, c] {
            store.save_running_state(assignment.id, true).await.unwrap();
            store.insert_assignment(assignment).await;
        }

        let supervisor = supervisor_over(store, Arc::new(InProcessGateway::new()));
        supervisor.reconcile().await.unwrap();

        let records = supervisor.status_for_channel(&ChannelId::from("chat-x")).await;
        assert_eq!(records.len(), 2);
        let ids: HashSet<AssignmentId> = records.iter().map(|r| r.assignment_id).collect();
        assert_eq!(ids, HashSet::from([a_id, b_id]));
    }
}
