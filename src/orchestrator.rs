//! Composition root: wires the supervisor and scheduler to the store and
//! gateway collaborators.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::dedup::Deduplicator;
use crate::error::Error;
use crate::gateway::MessageGateway;
use crate::handler::HandlerRegistry;
use crate::scheduler::{self, Scheduler};
use crate::store::Store;
use crate::types::AssignmentId;
use crate::worker::WorkerSupervisor;

/// The running engine: one supervisor, one scheduler, one ticker task.
pub struct Orchestrator {
    supervisor: Arc<WorkerSupervisor>,
    scheduler: Arc<Scheduler>,
    ticker_stop: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build everything, reconcile persisted worker intent, and start the
    /// scheduler tick loop. Returns the engine and the assignment ids
    /// reconcile brought up.
    pub async fn start(
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessageGateway>,
        registry: Arc<HandlerRegistry>,
        config: OrchestratorConfig,
    ) -> Result<(Self, Vec<AssignmentId>), Error> {
        let dedup = Arc::new(Deduplicator::new(store.clone()));
        let supervisor = Arc::new(WorkerSupervisor::new(
            store.clone(),
            gateway.clone(),
            registry,
            dedup,
            config.worker,
        ));
        let scheduler = Arc::new(Scheduler::load(store, gateway, config.scheduler).await?);

        let started = supervisor.reconcile().await?;

        let (ticker_stop, stop_rx) = watch::channel(false);
        let ticker = scheduler::spawn_ticker(scheduler.clone(), stop_rx);

        Ok((
            Self {
                supervisor,
                scheduler,
                ticker_stop,
                ticker: Mutex::new(Some(ticker)),
            },
            started,
        ))
    }

    /// Mutation and status entry points for the API collaborator.
    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stop the ticker and all workers. Persisted operator intent is left
    /// alone so the next boot reconciles back to the same topology.
    pub async fn shutdown(&self) {
        let _ = self.ticker_stop.send(true);
        if let Some(ticker) = self.ticker.lock().await.take() {
            let _ = ticker.await;
        }
        self.supervisor.shutdown().await;
        tracing::info!("orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::gateway::InProcessGateway;
    use crate::handler::EchoHandler;
    use crate::store::MemoryStore;
    use crate::types::Assignment;
    use crate::worker::WorkerState;

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));
        Arc::new(registry)
    }

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.worker.poll_interval = Duration::from_millis(5);
        config.scheduler.tick_interval = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn boot_reconciles_and_shutdown_preserves_intent() {
        let store = Arc::new(MemoryStore::new());
        let assignment = Assignment::new("bot1", "chat", "echo");
        let id = assignment.id;
        store.insert_assignment(assignment).await;
        store.save_running_state(id, true).await.unwrap();

        let gateway = Arc::new(InProcessGateway::new());
        let (orchestrator, started) = Orchestrator::start(
            store.clone(),
            gateway,
            registry(),
            fast_config(),
        )
        .await
        .unwrap();
        assert_eq!(started, vec![id]);

        orchestrator.shutdown().await;
        assert_eq!(
            orchestrator.supervisor().status(id).await.unwrap().state,
            WorkerState::Stopped
        );
        // Intent untouched: the next boot would bring the worker back.
        assert_eq!(store.load_running_assignments().await.unwrap(), vec![id]);
    }
}
