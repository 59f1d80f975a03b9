//! Run orchestration
//!
//! The `Orchestrator` handles every [`WorkItem`]:
//! - `Activate` replays workflow logic against history and persists the
//!   commands it produces (new steps, sleeps, or the run's result)
//! - `ExecuteStep` runs one physical step attempt and records its outcome,
//!   scheduling a retry timer when the policy allows one
//! - `FireTimer` records a due timer and resumes whatever it guards
//!
//! History is appended before any side effect is dispatched, so a crash at
//! any point leaves a log that the next activation can act on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::locks::RunLocks;
use super::registry::{RegistryError, WorkflowRegistry};
use crate::config::EngineConfig;
use crate::persistence::{EventStore, RunInfo, RunStatus, StoreError, TimerRecord};
use crate::reliability::{FailureClass, RetryDecision, RetryPolicy};
use crate::step::{StepContext, StepError, StepExecutor, StepOutcome};
use crate::timer::TimerService;
use crate::worker::{Dispatcher, WorkItem};
use crate::workflow::{
    codes, run_turn, Command, HistoryError, ResumeToken, RunHistory, TerminalEvent, TurnOutcome,
    WorkflowError, WorkflowEvent,
};

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Run already reached a terminal status
    #[error("run {0} already finished")]
    RunTerminal(Uuid),

    /// History could not be projected
    #[error("corrupt history: {0}")]
    CorruptHistory(#[from] HistoryError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Waiting for a run timed out
    #[error("timed out waiting for run {0}")]
    Timeout(Uuid),
}

impl EngineError {
    /// Whether handling the same work item later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::RunNotFound(run_id) => Self::RunNotFound(run_id),
            other => Self::Store(other),
        }
    }
}

/// A step attempt handed to the dispatcher and not yet finished
type AttemptKey = (Uuid, u32, u32);

/// Drives runs through replay, step execution and timers
pub struct Orchestrator {
    events: Arc<dyn EventStore>,
    timers: Arc<TimerService>,
    registry: Arc<WorkflowRegistry>,
    steps: Arc<StepExecutor>,
    dispatcher: Dispatcher,
    config: EngineConfig,
    locks: RunLocks,
    claimed: DashSet<AttemptKey>,
}

impl Orchestrator {
    pub fn new(
        events: Arc<dyn EventStore>,
        timers: Arc<TimerService>,
        registry: Arc<WorkflowRegistry>,
        steps: Arc<StepExecutor>,
        dispatcher: Dispatcher,
        config: EngineConfig,
    ) -> Self {
        Self {
            events,
            timers,
            registry,
            steps,
            dispatcher,
            config,
            locks: RunLocks::new(),
            claimed: DashSet::new(),
        }
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle one work item
    pub async fn handle(&self, item: WorkItem) -> Result<(), EngineError> {
        let result = match item {
            WorkItem::Activate { run_id } => self.activate(run_id).await,
            WorkItem::ExecuteStep {
                run_id,
                call_id,
                attempt,
            } => self.execute_step(run_id, call_id, attempt).await,
            WorkItem::FireTimer { run_id, timer_id } => self.fire_timer(run_id, timer_id).await,
        };
        self.locks.release(item.run_id());

        if let (WorkItem::ExecuteStep { run_id, call_id, attempt }, Err(e)) = (item, &result) {
            if !e.is_retryable() {
                self.claimed.remove(&(run_id, call_id, attempt));
            }
        }
        result
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Create a run, record its start and queue its first activation
    #[instrument(skip(self, input))]
    pub async fn start_run(&self, workflow_type: &str, input: Value) -> Result<Uuid, EngineError> {
        self.registry.get(workflow_type)?;

        let run_id = Uuid::now_v7();
        self.events
            .create_run(run_id, workflow_type, input.clone())
            .await?;
        self.events
            .append_events(
                run_id,
                0,
                vec![WorkflowEvent::RunStarted {
                    workflow_type: workflow_type.to_string(),
                    input,
                }],
            )
            .await?;

        info!(%run_id, "run enqueued");
        self.dispatcher.enqueue(WorkItem::Activate { run_id });
        Ok(run_id)
    }

    /// Cancel a run that has not finished
    #[instrument(skip(self, reason))]
    pub async fn cancel_run(&self, run_id: Uuid, reason: &str) -> Result<RunInfo, EngineError> {
        let guard = self.locks.lock(run_id).await;
        let cancelled = self.cancel_locked(run_id, reason).await;
        drop(guard);
        self.locks.release(run_id);
        cancelled?;

        info!(%run_id, reason, "run cancelled");
        Ok(self.events.get_run(run_id).await?)
    }

    async fn cancel_locked(&self, run_id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.events
            .get_run(run_id)
            .await
            .map_err(EngineError::from_store)?;
        let history = self.load_history(run_id).await?;
        if history.is_terminal() {
            return Err(EngineError::RunTerminal(run_id));
        }

        self.finish_run(
            run_id,
            &history,
            WorkflowEvent::RunCancelled {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Queue an activation for every run that has not finished
    ///
    /// Called at startup: activation re-dispatches interrupted step attempts
    /// and re-registers pending timers.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let active = self.events.list_active_runs().await?;
        for run in &active {
            self.dispatcher.enqueue(WorkItem::Activate { run_id: run.id });
        }
        if !active.is_empty() {
            info!(runs = active.len(), "recovering unfinished runs");
        }
        Ok(active.len())
    }

    // =========================================================================
    // Activation
    // =========================================================================

    #[instrument(skip(self))]
    async fn activate(&self, run_id: Uuid) -> Result<(), EngineError> {
        let _guard = self.locks.lock(run_id).await;

        let run = self.events.get_run(run_id).await?;
        let mut entries = self.events.load_events(run_id).await?;
        if entries.is_empty() {
            // created but RunStarted never landed
            self.events
                .append_events(
                    run_id,
                    0,
                    vec![WorkflowEvent::RunStarted {
                        workflow_type: run.workflow_type.clone(),
                        input: run.input.clone(),
                    }],
                )
                .await?;
            entries = self.events.load_events(run_id).await?;
        }
        let history = RunHistory::from_entries(&entries)?;

        if let Some(terminal) = history.terminal() {
            if run.status != terminal.status() {
                warn!(%run_id, status = %run.status, "repairing status of finished run");
                self.project_terminal(run_id, &history).await?;
            }
            return Ok(());
        }

        if history.next_sequence() as usize >= self.config.max_events_per_run {
            let error = WorkflowError::new(format!(
                "history reached {} events",
                history.next_sequence()
            ))
            .with_code(codes::HISTORY_LIMIT);
            error!(%run_id, "run exceeded event limit");
            return self
                .finish_run(run_id, &history, WorkflowEvent::RunFailed { error })
                .await;
        }

        let workflow_type = history
            .workflow_type()
            .unwrap_or(run.workflow_type.as_str());
        let workflow = self.registry.get(workflow_type)?;

        if run.status != RunStatus::Running {
            self.events
                .update_run_status(run_id, RunStatus::Running, None, None)
                .await?;
        }

        let history = Arc::new(history);
        let input = history.input().clone();
        let outcome = run_turn(run_id, Arc::clone(&history), |ctx| workflow.run(ctx, input));

        match outcome {
            TurnOutcome::Completed(result) => {
                info!(%run_id, "run completed");
                self.finish_run(run_id, &history, WorkflowEvent::RunCompleted { result })
                    .await
            }
            TurnOutcome::Failed(error) => {
                info!(%run_id, error = %error, "run failed");
                self.finish_run(run_id, &history, WorkflowEvent::RunFailed { error })
                    .await
            }
            TurnOutcome::Diverged(reason) => {
                error!(%run_id, %reason, "replay diverged from history");
                let error = WorkflowError::nondeterminism(reason);
                self.finish_run(run_id, &history, WorkflowEvent::RunFailed { error })
                    .await
            }
            TurnOutcome::Suspended { commands } => {
                self.suspend(run_id, &history, commands).await
            }
        }
    }

    /// Persist new commands, then dispatch them and anything left unfinished
    async fn suspend(
        &self,
        run_id: Uuid,
        history: &RunHistory,
        commands: Vec<Command>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut events = Vec::with_capacity(commands.len());
        let mut new_steps = vec![];
        let mut new_timers = vec![];

        for command in commands {
            match command {
                Command::ScheduleStep {
                    call_id,
                    step_name,
                    input,
                    retry_policy,
                } => {
                    let retry_policy = retry_policy
                        .or_else(|| self.steps.retry_policy(&step_name))
                        .unwrap_or_else(|| self.config.default_retry_policy.clone());
                    debug!(%run_id, call_id, %step_name, "scheduling step");
                    events.push(WorkflowEvent::StepScheduled {
                        call_id,
                        step_name,
                        input,
                        retry_policy,
                    });
                    new_steps.push(call_id);
                }
                Command::StartSleep { call_id, duration } => {
                    let timer = TimerRecord {
                        id: Uuid::now_v7(),
                        run_id,
                        fire_at: fire_at(now, duration),
                        resume: ResumeToken::Sleep {
                            call_id,
                            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                        },
                    };
                    debug!(%run_id, call_id, fire_at = %timer.fire_at, "starting sleep");
                    events.push(WorkflowEvent::TimerScheduled {
                        timer_id: timer.id,
                        fire_at: timer.fire_at,
                        resume: timer.resume.clone(),
                    });
                    new_timers.push(timer);
                }
            }
        }

        if !events.is_empty() {
            self.events
                .append_events(run_id, history.next_sequence(), events)
                .await?;
        }
        self.events
            .update_run_status(run_id, RunStatus::Suspended, None, None)
            .await?;

        // timers already in history may never have reached the timer table
        let registered: HashSet<Uuid> = self
            .timers
            .pending(run_id)
            .await?
            .into_iter()
            .map(|timer| timer.id)
            .collect();
        for (timer_id, timer) in history
            .pending_timers()
            .filter(|(timer_id, _)| !registered.contains(timer_id))
        {
            warn!(%run_id, %timer_id, "restoring timer missing from the timer table");
            self.timers
                .schedule(&TimerRecord {
                    id: timer_id,
                    run_id,
                    fire_at: timer.fire_at,
                    resume: timer.resume.clone(),
                })
                .await?;
        }
        for timer in &new_timers {
            self.timers.schedule(timer).await?;
        }

        for step in history.steps() {
            if let Some(attempt) = step.next_attempt() {
                self.enqueue_step(run_id, step.call_id, attempt);
            }
        }
        for call_id in new_steps {
            self.enqueue_step(run_id, call_id, 1);
        }

        Ok(())
    }

    /// Append the terminal event, cancelling whatever timers are still pending
    async fn finish_run(
        &self,
        run_id: Uuid,
        history: &RunHistory,
        terminal: WorkflowEvent,
    ) -> Result<(), EngineError> {
        let (status, result, error) = match &terminal {
            WorkflowEvent::RunCompleted { result } => {
                (RunStatus::Completed, Some(result.clone()), None)
            }
            WorkflowEvent::RunFailed { error } => (RunStatus::Failed, None, Some(error.clone())),
            _ => (RunStatus::Cancelled, None, None),
        };

        let pending: Vec<Uuid> = history.pending_timers().map(|(id, _)| id).collect();
        let mut events: Vec<WorkflowEvent> = pending
            .iter()
            .map(|timer_id| WorkflowEvent::TimerCancelled {
                timer_id: *timer_id,
            })
            .collect();
        events.push(terminal);

        self.events
            .append_events(run_id, history.next_sequence(), events)
            .await?;
        self.events
            .update_run_status(run_id, status, result, error)
            .await?;

        for timer_id in pending {
            if let Err(e) = self.timers.cancel(timer_id).await {
                warn!(%run_id, %timer_id, error = %e, "cannot cancel timer");
            }
        }
        Ok(())
    }

    /// Copy the terminal event of history into the run's status projection
    async fn project_terminal(&self, run_id: Uuid, history: &RunHistory) -> Result<(), EngineError> {
        let Some(terminal) = history.terminal() else {
            return Ok(());
        };
        let (result, error) = match terminal {
            TerminalEvent::Completed(result) => (Some(result.clone()), None),
            TerminalEvent::Failed(error) => (None, Some(error.clone())),
            TerminalEvent::Cancelled(_) => (None, None),
        };
        self.events
            .update_run_status(run_id, terminal.status(), result, error)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Step execution
    // =========================================================================

    fn enqueue_step(&self, run_id: Uuid, call_id: u32, attempt: u32) {
        if self.claimed.insert((run_id, call_id, attempt)) {
            self.dispatcher.enqueue(WorkItem::ExecuteStep {
                run_id,
                call_id,
                attempt,
            });
        }
    }

    #[instrument(skip(self))]
    async fn execute_step(&self, run_id: Uuid, call_id: u32, attempt: u32) -> Result<(), EngineError> {
        let key = (run_id, call_id, attempt);

        let (ctx, input, policy) = {
            let _guard = self.locks.lock(run_id).await;
            let history = self.load_history(run_id).await?;

            let runnable = !history.is_terminal()
                && history.step(call_id).is_some_and(|step| {
                    step.resolution.is_none()
                        && step.pending_retry.is_none()
                        && step.last_recorded_attempt + 1 == attempt
                });
            let Some(step) = history.step(call_id).filter(|_| runnable) else {
                debug!(%run_id, call_id, attempt, "step attempt is stale, skipping");
                self.restore_retry_timer(run_id, &history, call_id).await?;
                self.claimed.remove(&key);
                return Ok(());
            };

            self.events
                .append_events(
                    run_id,
                    history.next_sequence(),
                    vec![WorkflowEvent::StepStarted {
                        call_id,
                        attempt,
                        worker_id: self.config.worker_id.clone(),
                    }],
                )
                .await?;

            let ctx = StepContext::new(
                run_id,
                call_id,
                step.step_name.clone(),
                attempt,
                step.retry_policy.effective_max_attempts(),
            );
            (ctx, step.input.clone(), step.retry_policy.clone())
        };

        debug!(%run_id, call_id, attempt, step_name = %ctx.step_name, "executing step");
        let outcome = self.steps.execute(&ctx, input).await;

        let _guard = self.locks.lock(run_id).await;
        let history = self.load_history(run_id).await?;
        let still_wanted = !history.is_terminal()
            && history
                .step(call_id)
                .is_some_and(|step| step.resolution.is_none() && step.last_recorded_attempt < attempt);
        if !still_wanted {
            debug!(%run_id, call_id, attempt, "discarding outcome of superseded attempt");
            self.claimed.remove(&key);
            return Ok(());
        }

        let (events, timer) = match outcome {
            StepOutcome::Success(result) => {
                debug!(%run_id, call_id, attempt, "step completed");
                let completed = WorkflowEvent::StepCompleted {
                    call_id,
                    attempt,
                    result,
                };
                (vec![completed], None)
            }
            StepOutcome::TransientFailure(error) => {
                failure_events(run_id, call_id, attempt, &policy, error, FailureClass::Transient)
            }
            StepOutcome::PermanentFailure(error) => {
                failure_events(run_id, call_id, attempt, &policy, error, FailureClass::Permanent)
            }
        };

        self.events
            .append_events(run_id, history.next_sequence(), events)
            .await?;
        self.claimed.remove(&key);

        match timer {
            Some(record) => {
                self.timers.schedule(&record).await?;
            }
            None => self.dispatcher.enqueue(WorkItem::Activate { run_id }),
        }
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Register a step's pending retry timer again; a no-op if the table has it
    async fn restore_retry_timer(
        &self,
        run_id: Uuid,
        history: &RunHistory,
        call_id: u32,
    ) -> Result<(), EngineError> {
        let Some(retry) = history.step(call_id).and_then(|step| step.pending_retry.as_ref()) else {
            return Ok(());
        };
        let Some(timer) = history.timer(retry.timer_id).filter(|t| t.is_pending()) else {
            return Ok(());
        };
        self.timers
            .schedule(&TimerRecord {
                id: retry.timer_id,
                run_id,
                fire_at: timer.fire_at,
                resume: timer.resume.clone(),
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fire_timer(&self, run_id: Uuid, timer_id: Uuid) -> Result<(), EngineError> {
        let _guard = self.locks.lock(run_id).await;
        let history = self.load_history(run_id).await?;

        let Some(timer) = history.timer(timer_id).cloned() else {
            warn!(%run_id, %timer_id, "timer unknown to run history, cancelling");
            self.timers.cancel(timer_id).await?;
            return Ok(());
        };

        if history.is_terminal() || timer.cancelled {
            debug!(%run_id, %timer_id, "timer belongs to a finished run");
            self.timers.cancel(timer_id).await?;
            return Ok(());
        }

        if !timer.fired {
            if Utc::now() < timer.fire_at {
                debug!(%run_id, %timer_id, "timer delivered early");
                self.timers.release(timer_id);
                return Ok(());
            }
            self.events
                .append_events(
                    run_id,
                    history.next_sequence(),
                    vec![WorkflowEvent::TimerFired { timer_id }],
                )
                .await?;
            debug!(%run_id, %timer_id, "timer fired");
        }
        self.timers.acknowledge(timer_id).await?;

        match timer.resume {
            ResumeToken::Sleep { .. } => self.dispatcher.enqueue(WorkItem::Activate { run_id }),
            ResumeToken::StepRetry { call_id, attempt } => {
                self.enqueue_step(run_id, call_id, attempt)
            }
        }
        Ok(())
    }

    async fn load_history(&self, run_id: Uuid) -> Result<RunHistory, EngineError> {
        let entries = self.events.load_events(run_id).await?;
        Ok(RunHistory::from_entries(&entries)?)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("steps", &self.steps)
            .field("active_locks", &self.locks.len())
            .finish()
    }
}

/// Events recording a failed attempt, plus the retry timer if the policy grants one
fn failure_events(
    run_id: Uuid,
    call_id: u32,
    attempt: u32,
    policy: &RetryPolicy,
    error: StepError,
    class: FailureClass,
) -> (Vec<WorkflowEvent>, Option<TimerRecord>) {
    match policy.decide(attempt, class) {
        RetryDecision::RetryAfter(delay) => {
            warn!(
                %run_id, call_id, attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step attempt failed, retrying"
            );
            let timer = TimerRecord {
                id: Uuid::now_v7(),
                run_id,
                fire_at: fire_at(Utc::now(), delay),
                resume: ResumeToken::StepRetry {
                    call_id,
                    attempt: attempt + 1,
                },
            };
            let events = vec![
                WorkflowEvent::StepFailed {
                    call_id,
                    attempt,
                    error,
                    will_retry: true,
                },
                WorkflowEvent::TimerScheduled {
                    timer_id: timer.id,
                    fire_at: timer.fire_at,
                    resume: timer.resume.clone(),
                },
            ];
            (events, Some(timer))
        }
        RetryDecision::GiveUp => {
            warn!(%run_id, call_id, attempt, ?class, error = %error, "step failed");
            let failed = WorkflowEvent::StepFailed {
                call_id,
                attempt,
                error,
                will_retry: false,
            };
            (vec![failed], None)
        }
    }
}

/// Wall-clock instant `delay` after `now`, saturating far in the future
fn fire_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
