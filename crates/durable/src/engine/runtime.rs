//! Engine assembly and the public run API

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::orchestrator::{EngineError, Orchestrator};
use super::registry::WorkflowRegistry;
use crate::config::EngineConfig;
use crate::persistence::{EventStore, HistoryEntry, RunFilter, RunInfo, TimerStore};
use crate::step::{Step, StepExecutor};
use crate::timer::TimerService;
use crate::worker::{self, WorkerPool};
use crate::workflow::{RunHistory, Workflow};

/// Builder for an [`Engine`]
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new(Arc::new(InMemoryEventStore::new()))
///     .workflow(UserSignup)
///     .step(CreateUser)
///     .step(SendWelcomeEmail)
///     .start()
///     .await?;
///
/// let run_id = engine.start_workflow::<UserSignup>("ada@example.com".into()).await?;
/// ```
pub struct EngineBuilder {
    events: Arc<dyn EventStore>,
    timers: Arc<dyn TimerStore>,
    config: EngineConfig,
    registry: WorkflowRegistry,
    steps: StepExecutor,
}

impl EngineBuilder {
    /// Start building an engine over a store that holds both runs and timers
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: EventStore + TimerStore,
    {
        Self {
            events: store.clone(),
            timers: store,
            config: EngineConfig::default(),
            registry: WorkflowRegistry::new(),
            steps: StepExecutor::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register workflow logic under `W::TYPE`
    pub fn workflow<W: Workflow>(mut self, workflow: W) -> Self {
        self.registry.register(workflow);
        self
    }

    /// Register a step under `S::NAME`
    pub fn step<S: Step>(mut self, step: S) -> Self {
        self.steps.register(step);
        self
    }

    /// Start the worker pool and timer loop, then recover unfinished runs
    pub async fn start(self) -> Result<Engine, EngineError> {
        let (dispatcher, queue) = worker::channel();
        let timers = Arc::new(TimerService::new(
            self.timers,
            dispatcher.clone(),
            &self.config,
        ));

        info!(
            worker_id = %self.config.worker_id,
            workflows = ?self.registry.workflow_types().collect::<Vec<_>>(),
            steps = ?self.steps.step_names().collect::<Vec<_>>(),
            "starting engine"
        );

        let orchestrator = Arc::new(Orchestrator::new(
            self.events,
            Arc::clone(&timers),
            Arc::new(self.registry),
            Arc::new(self.steps),
            dispatcher.clone(),
            self.config.clone(),
        ));

        let pool = WorkerPool::new(Arc::clone(&orchestrator), dispatcher, &self.config);
        if let Err(e) = pool.start(queue) {
            warn!(error = %e, "worker pool did not start");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer_handle = tokio::spawn(async move { timers.run(shutdown_rx).await });

        let engine = Engine {
            orchestrator,
            pool,
            shutdown_tx,
            timer_handle: Mutex::new(Some(timer_handle)),
        };
        engine.recover().await?;
        Ok(engine)
    }
}

/// A running engine: worker pool, timer loop and the run API
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start a run of a typed workflow
    pub async fn start_workflow<W: Workflow>(&self, input: W::Input) -> Result<Uuid, EngineError> {
        let input = serde_json::to_value(input)?;
        self.orchestrator.start_run(W::TYPE, input).await
    }

    /// Start a run by workflow type name with JSON input
    pub async fn start_run(&self, workflow_type: &str, input: Value) -> Result<Uuid, EngineError> {
        self.orchestrator.start_run(workflow_type, input).await
    }

    /// Cancel a run that has not finished
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<RunInfo, EngineError> {
        self.orchestrator.cancel_run(run_id, reason).await
    }

    /// Current status projection of a run
    pub async fn run(&self, run_id: Uuid) -> Result<RunInfo, EngineError> {
        self.orchestrator
            .events()
            .get_run(run_id)
            .await
            .map_err(EngineError::from_store)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunInfo>, EngineError> {
        Ok(self.orchestrator.events().list_runs(filter).await?)
    }

    /// Raw event history of a run
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<HistoryEntry>, EngineError> {
        self.orchestrator
            .events()
            .load_events(run_id)
            .await
            .map_err(EngineError::from_store)
    }

    /// History of a run projected per call
    pub async fn run_history(&self, run_id: Uuid) -> Result<RunHistory, EngineError> {
        let entries = self.history(run_id).await?;
        Ok(RunHistory::from_entries(&entries)?)
    }

    /// Poll until the run reaches a terminal status
    #[instrument(skip(self))]
    pub async fn wait_for_terminal(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> Result<RunInfo, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(run_id));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Queue an activation for every unfinished run
    pub async fn recover(&self) -> Result<usize, EngineError> {
        self.orchestrator.recover().await
    }

    /// Work items being handled right now
    pub fn current_load(&self) -> usize {
        self.pool.current_load()
    }

    /// Work items waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.orchestrator.dispatcher().queue_depth()
    }

    pub fn worker_id(&self) -> &str {
        self.pool.worker_id()
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    /// Stop the timer loop and drain the worker pool
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shutdown_tx.send_replace(true);
        let handle = self.timer_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "timer loop ended abnormally");
            }
        }
        if let Err(e) = self.pool.shutdown().await {
            warn!(error = %e, "worker pool did not drain cleanly");
        }
        info!("engine stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("worker_id", &self.pool.worker_id())
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
