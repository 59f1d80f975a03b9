//! Replay context handed to workflow logic
//!
//! Every `step`/`sleep` call takes the next call id at creation. Polling the
//! returned future consults the recorded history for that id: a recorded
//! outcome resolves immediately, a missing record becomes a new command and
//! the future stays pending. The orchestrator polls the workflow future once
//! per activation, so a pending call suspends the run.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::definition::codes;
use super::duration::parse_span;
use super::history::{CallRecord, RunHistory, StepResolution};
use super::WorkflowError;
use crate::reliability::RetryPolicy;
use crate::step::{Step, StepError, StepFailure};

/// New work requested by workflow logic during one activation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleStep {
        call_id: u32,
        step_name: String,
        input: Value,
        retry_policy: Option<RetryPolicy>,
    },
    StartSleep {
        call_id: u32,
        duration: Duration,
    },
}

impl Command {
    pub fn call_id(&self) -> u32 {
        match self {
            Self::ScheduleStep { call_id, .. } | Self::StartSleep { call_id, .. } => *call_id,
        }
    }
}

struct ContextInner {
    run_id: Uuid,
    history: Arc<RunHistory>,
    next_call_id: u32,
    commands: Vec<Command>,
    awaiting_history: bool,
    divergence: Option<String>,
}

impl ContextInner {
    fn allocate(&mut self) -> u32 {
        let call_id = self.next_call_id;
        self.next_call_id += 1;
        call_id
    }

    fn diverge(&mut self, reason: String) {
        if self.divergence.is_none() {
            self.divergence = Some(reason);
        }
    }

    fn push_command(&mut self, command: Command) {
        let call_id = command.call_id();
        if !self.commands.iter().any(|c| c.call_id() == call_id) {
            self.commands.push(command);
        }
    }

    fn poll_step(
        &mut self,
        call_id: u32,
        step_name: &str,
        input: &mut Option<Value>,
        retry_policy: &Option<RetryPolicy>,
    ) -> Poll<Result<Value, StepFailure>> {
        if self.divergence.is_some() {
            return Poll::Pending;
        }

        let recorded = match self.history.call(call_id) {
            Some(CallRecord::Step(step)) if step.step_name == step_name => {
                step.resolution.clone()
            }
            Some(other) => {
                let reason = format!(
                    "call {call_id} was recorded as {} but workflow issued step '{step_name}'",
                    other.describe()
                );
                self.diverge(reason);
                return Poll::Pending;
            }
            None => {
                if let Some(input) = input.take() {
                    self.push_command(Command::ScheduleStep {
                        call_id,
                        step_name: step_name.to_string(),
                        input,
                        retry_policy: retry_policy.clone(),
                    });
                }
                return Poll::Pending;
            }
        };

        match recorded {
            Some(StepResolution::Completed(value)) => Poll::Ready(Ok(value)),
            Some(StepResolution::Failed(error)) => Poll::Ready(Err(StepFailure {
                step_name: step_name.to_string(),
                call_id,
                error,
            })),
            None => {
                self.awaiting_history = true;
                Poll::Pending
            }
        }
    }

    fn poll_sleep(&mut self, call_id: u32, duration: Duration) -> Poll<()> {
        if self.divergence.is_some() {
            return Poll::Pending;
        }

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        match self.history.call(call_id) {
            Some(CallRecord::Sleep(sleep)) if sleep.duration_ms == duration_ms => {
                if sleep.fired {
                    Poll::Ready(())
                } else {
                    self.awaiting_history = true;
                    Poll::Pending
                }
            }
            Some(other) => {
                let reason = format!(
                    "call {call_id} was recorded as {} but workflow issued a sleep of {duration_ms}ms",
                    other.describe()
                );
                self.diverge(reason);
                Poll::Pending
            }
            None => {
                self.push_command(Command::StartSleep { call_id, duration });
                Poll::Pending
            }
        }
    }
}

/// Handle through which workflow logic issues durable calls
///
/// Cheap to clone; clones share the same replay state.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl WorkflowContext {
    pub(crate) fn new(run_id: Uuid, history: Arc<RunHistory>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                run_id,
                history,
                next_call_id: 0,
                commands: vec![],
                awaiting_history: false,
                divergence: None,
            })),
        }
    }

    /// ID of the run being replayed
    pub fn run_id(&self) -> Uuid {
        self.inner.lock().run_id
    }

    /// True while the logic is re-issuing calls that history already holds
    ///
    /// Use it to keep log lines from repeating on every activation.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .history
            .call_ids()
            .last()
            .is_some_and(|last| inner.next_call_id <= last)
    }

    /// Call a registered step with its declared (or the engine default) retry policy
    pub fn step<S: Step>(&self, input: S::Input) -> StepCall<S::Output> {
        self.call_step(S::NAME, input, None)
    }

    /// Call a registered step with an explicit retry policy for this call
    pub fn step_with_policy<S: Step>(
        &self,
        input: S::Input,
        policy: RetryPolicy,
    ) -> StepCall<S::Output> {
        self.call_step(S::NAME, input, Some(policy))
    }

    /// Call a step by name with JSON input and output
    pub fn step_by_name(&self, step_name: &str, input: Value) -> StepCall<Value> {
        self.call_step(step_name, input, None)
    }

    fn call_step<I: Serialize, O>(
        &self,
        step_name: &str,
        input: I,
        retry_policy: Option<RetryPolicy>,
    ) -> StepCall<O> {
        let call_id = self.inner.lock().allocate();
        let (input, early) = match serde_json::to_value(input) {
            Ok(value) => (Some(value), None),
            Err(e) => (
                None,
                Some(StepFailure {
                    step_name: step_name.to_string(),
                    call_id,
                    error: StepError::fatal(format!("cannot serialize step input: {e}"))
                        .with_type("SERIALIZATION"),
                }),
            ),
        };

        StepCall {
            ctx: self.clone(),
            call_id,
            step_name: step_name.to_string(),
            input,
            retry_policy,
            early,
            _output: PhantomData,
        }
    }

    /// Suspend for a human-readable span such as `"5s"` or `"1h30m"`
    ///
    /// An unparsable span resolves to a `WorkflowError` without suspending.
    pub fn sleep(&self, span: &str) -> Sleep {
        match parse_span(span) {
            Ok(duration) => {
                let call = self.sleep_for(duration);
                Sleep {
                    call: Some(call),
                    error: None,
                }
            }
            Err(e) => Sleep {
                call: None,
                error: Some(
                    WorkflowError::new(format!("invalid sleep span: {e}"))
                        .with_code(codes::INVALID_SPAN),
                ),
            },
        }
    }

    /// Suspend for a fixed duration
    pub fn sleep_for(&self, duration: Duration) -> SleepCall {
        let call_id = self.inner.lock().allocate();
        SleepCall {
            ctx: self.clone(),
            call_id,
            duration,
        }
    }

    /// Drain the result of one activation
    pub(crate) fn finish(self) -> TurnState {
        let mut inner = self.inner.lock();
        TurnState {
            commands: std::mem::take(&mut inner.commands),
            issued: inner.next_call_id,
            awaiting_history: inner.awaiting_history,
            divergence: inner.divergence.take(),
        }
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkflowContext")
            .field("run_id", &inner.run_id)
            .field("next_call_id", &inner.next_call_id)
            .finish()
    }
}

/// Future returned by [`WorkflowContext::step`]
#[must_use = "step calls do nothing unless awaited"]
pub struct StepCall<O> {
    ctx: WorkflowContext,
    call_id: u32,
    step_name: String,
    input: Option<Value>,
    retry_policy: Option<RetryPolicy>,
    early: Option<StepFailure>,
    _output: PhantomData<fn() -> O>,
}

impl<O> StepCall<O> {
    /// Position of this call within the run
    pub fn call_id(&self) -> u32 {
        self.call_id
    }
}

impl<O: DeserializeOwned> Future for StepCall<O> {
    type Output = Result<O, StepFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(failure) = this.early.take() {
            return Poll::Ready(Err(failure));
        }

        let mut inner = this.ctx.inner.lock();
        let value = match inner.poll_step(
            this.call_id,
            &this.step_name,
            &mut this.input,
            &this.retry_policy,
        ) {
            Poll::Ready(Ok(value)) => value,
            Poll::Ready(Err(failure)) => return Poll::Ready(Err(failure)),
            Poll::Pending => return Poll::Pending,
        };

        match serde_json::from_value(value) {
            Ok(output) => Poll::Ready(Ok(output)),
            Err(e) => {
                let reason = format!(
                    "recorded result of call {} (step '{}') does not decode: {e}",
                    this.call_id, this.step_name
                );
                inner.diverge(reason);
                Poll::Pending
            }
        }
    }
}

/// Future returned by [`WorkflowContext::sleep_for`]
#[must_use = "sleeps do nothing unless awaited"]
pub struct SleepCall {
    ctx: WorkflowContext,
    call_id: u32,
    duration: Duration,
}

impl Future for SleepCall {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        this.ctx.inner.lock().poll_sleep(this.call_id, this.duration)
    }
}

/// Future returned by [`WorkflowContext::sleep`]
#[must_use = "sleeps do nothing unless awaited"]
pub struct Sleep {
    call: Option<SleepCall>,
    error: Option<WorkflowError>,
}

impl Future for Sleep {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(error) = this.error.take() {
            return Poll::Ready(Err(error));
        }
        match this.call.as_mut() {
            Some(call) => Pin::new(call).poll(cx).map(Ok),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Bookkeeping collected from the context after one poll
pub(crate) struct TurnState {
    pub commands: Vec<Command>,
    /// Calls the logic created this turn, polled or not
    pub issued: u32,
    pub awaiting_history: bool,
    pub divergence: Option<String>,
}

/// Result of replaying workflow logic once against history
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The logic returned a value
    Completed(Value),

    /// The logic returned an error
    Failed(WorkflowError),

    /// The logic is waiting; `commands` holds new work, possibly none
    Suspended { commands: Vec<Command> },

    /// Replay contradicted history
    Diverged(String),
}

/// Poll the workflow future exactly once against `history`
pub(crate) fn run_turn<'a>(
    run_id: Uuid,
    history: Arc<RunHistory>,
    start: impl FnOnce(WorkflowContext) -> BoxFuture<'a, Result<Value, WorkflowError>>,
) -> TurnOutcome {
    let ctx = WorkflowContext::new(run_id, history.clone());
    let result = start(ctx.clone()).now_or_never();
    let state = ctx.finish();

    if let Some(reason) = state.divergence {
        return TurnOutcome::Diverged(reason);
    }

    // A call created but never polled (e.g. dropped by a join that returned
    // early) still counts as issued; only calls past the last one created are missing
    let unobserved: Vec<u32> = history
        .call_ids()
        .filter(|id| *id >= state.issued)
        .collect();
    if !unobserved.is_empty() {
        return TurnOutcome::Diverged(format!(
            "recorded calls {unobserved:?} were not issued on replay"
        ));
    }

    match result {
        Some(Ok(value)) => TurnOutcome::Completed(value),
        Some(Err(error)) => TurnOutcome::Failed(error),
        None if state.commands.is_empty() && !state.awaiting_history => TurnOutcome::Diverged(
            "workflow awaited something other than a step or sleep".to_string(),
        ),
        None => TurnOutcome::Suspended {
            commands: state.commands,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepContext;
    use crate::workflow::history::tests::{entries, scheduled, started};
    use crate::workflow::{ResumeToken, WorkflowEvent};
    use async_trait::async_trait;
    use chrono::Utc;

    struct Double;

    #[async_trait]
    impl Step for Double {
        const NAME: &'static str = "double";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &StepContext, input: i64) -> Result<i64, StepError> {
            Ok(input * 2)
        }
    }

    fn history(events: Vec<WorkflowEvent>) -> Arc<RunHistory> {
        Arc::new(RunHistory::from_entries(&entries(events)).expect("valid history"))
    }

    fn completed(call_id: u32, result: Value) -> WorkflowEvent {
        WorkflowEvent::StepCompleted {
            call_id,
            attempt: 1,
            result,
        }
    }

    fn two_doubles_then_sleep(
        ctx: WorkflowContext,
    ) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let a = ctx.step::<Double>(1).await?;
            let b = ctx.step::<Double>(a).await?;
            ctx.sleep("5s").await?;
            Ok(serde_json::json!(b))
        })
    }

    #[test]
    fn test_first_turn_schedules_first_step_only() {
        let outcome = run_turn(Uuid::now_v7(), history(vec![started()]), two_doubles_then_sleep);

        match outcome {
            TurnOutcome::Suspended { commands } => {
                assert_eq!(commands.len(), 1);
                assert!(matches!(
                    &commands[0],
                    Command::ScheduleStep { call_id: 0, step_name, input, .. }
                        if step_name == "double" && *input == serde_json::json!(1)
                ));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_recorded_results_short_circuit() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
            scheduled(1, "double"),
            completed(1, serde_json::json!(4)),
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        match outcome {
            TurnOutcome::Suspended { commands } => {
                assert_eq!(
                    commands,
                    vec![Command::StartSleep {
                        call_id: 2,
                        duration: Duration::from_secs(5)
                    }]
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_replay_is_idempotent() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
        ]);

        let first = run_turn(Uuid::now_v7(), h.clone(), two_doubles_then_sleep);
        let second = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fired_sleep_lets_logic_complete() {
        let timer_id = Uuid::now_v7();
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
            scheduled(1, "double"),
            completed(1, serde_json::json!(4)),
            WorkflowEvent::TimerScheduled {
                timer_id,
                fire_at: Utc::now(),
                resume: ResumeToken::Sleep {
                    call_id: 2,
                    duration_ms: 5000,
                },
            },
            WorkflowEvent::TimerFired { timer_id },
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        assert_eq!(outcome, TurnOutcome::Completed(serde_json::json!(4)));
    }

    #[test]
    fn test_unfired_sleep_stays_suspended_without_commands() {
        let timer_id = Uuid::now_v7();
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
            scheduled(1, "double"),
            completed(1, serde_json::json!(4)),
            WorkflowEvent::TimerScheduled {
                timer_id,
                fire_at: Utc::now(),
                resume: ResumeToken::Sleep {
                    call_id: 2,
                    duration_ms: 5000,
                },
            },
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        assert_eq!(outcome, TurnOutcome::Suspended { commands: vec![] });
    }

    #[test]
    fn test_terminal_step_failure_is_catchable() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            WorkflowEvent::StepFailed {
                call_id: 0,
                attempt: 1,
                error: StepError::fatal("bad"),
                will_retry: false,
            },
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, |ctx| {
            Box::pin(async move {
                match ctx.step::<Double>(1).await {
                    Ok(_) => Ok(serde_json::json!("ok")),
                    Err(failure) => Ok(serde_json::json!({"compensated": failure.error.message})),
                }
            })
        });
        assert_eq!(
            outcome,
            TurnOutcome::Completed(serde_json::json!({"compensated": "bad"}))
        );
    }

    #[test]
    fn test_step_name_mismatch_diverges() {
        let h = history(vec![started(), scheduled(0, "triple")]);
        let outcome = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        assert!(matches!(outcome, TurnOutcome::Diverged(reason) if reason.contains("triple")));
    }

    #[test]
    fn test_missing_recorded_call_diverges() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
        ]);
        let outcome = run_turn(Uuid::now_v7(), h, |_ctx| {
            Box::pin(async move { Ok(serde_json::json!("skipped everything")) })
        });
        assert!(matches!(outcome, TurnOutcome::Diverged(_)));
    }

    #[test]
    fn test_undecodable_result_diverges() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!("not a number")),
        ]);
        let outcome = run_turn(Uuid::now_v7(), h, two_doubles_then_sleep);
        assert!(matches!(outcome, TurnOutcome::Diverged(reason) if reason.contains("decode")));
    }

    #[test]
    fn test_foreign_await_diverges() {
        let outcome = run_turn(Uuid::now_v7(), history(vec![started()]), |_ctx| {
            Box::pin(async move {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            })
        });
        assert!(matches!(outcome, TurnOutcome::Diverged(_)));
    }

    #[test]
    fn test_fan_out_schedules_in_positional_order() {
        let outcome = run_turn(Uuid::now_v7(), history(vec![started()]), |ctx| {
            Box::pin(async move {
                let calls = (0..3).map(|i| ctx.step::<Double>(i)).collect::<Vec<_>>();
                let results = futures::future::join_all(calls).await;
                let values: Result<Vec<i64>, _> = results.into_iter().collect();
                Ok(serde_json::json!(values?))
            })
        });

        match outcome {
            TurnOutcome::Suspended { commands } => {
                let ids: Vec<u32> = commands.iter().map(Command::call_id).collect();
                assert_eq!(ids, vec![0, 1, 2]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_fan_out_join_order_ignores_completion_order() {
        // call 2 finished first, call 0 last
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            scheduled(1, "double"),
            scheduled(2, "double"),
            completed(2, serde_json::json!(4)),
            completed(1, serde_json::json!(2)),
            completed(0, serde_json::json!(0)),
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, |ctx| {
            Box::pin(async move {
                let calls = (0..3).map(|i| ctx.step::<Double>(i)).collect::<Vec<_>>();
                let results = futures::future::join_all(calls).await;
                let values: Result<Vec<i64>, _> = results.into_iter().collect();
                Ok(serde_json::json!(values?))
            })
        });
        assert_eq!(outcome, TurnOutcome::Completed(serde_json::json!([0, 2, 4])));
    }

    #[test]
    fn test_try_join_returning_early_on_recorded_failure_completes() {
        // call 1 failed terminally, so try_join_all never polls call 2 on replay
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            scheduled(1, "double"),
            scheduled(2, "double"),
            completed(0, serde_json::json!(0)),
            WorkflowEvent::StepFailed {
                call_id: 1,
                attempt: 1,
                error: StepError::fatal("bad"),
                will_retry: false,
            },
            completed(2, serde_json::json!(4)),
        ]);

        let outcome = run_turn(Uuid::now_v7(), h, |ctx| {
            Box::pin(async move {
                let calls = (0..3).map(|i| ctx.step::<Double>(i)).collect::<Vec<_>>();
                match futures::future::try_join_all(calls).await {
                    Ok(values) => Ok(serde_json::json!(values)),
                    Err(failure) => Ok(serde_json::json!({"compensated": failure.call_id})),
                }
            })
        });
        assert_eq!(
            outcome,
            TurnOutcome::Completed(serde_json::json!({"compensated": 1}))
        );
    }

    #[test]
    fn test_invalid_span_fails_without_suspending() {
        let outcome = run_turn(Uuid::now_v7(), history(vec![started()]), |ctx| {
            Box::pin(async move {
                ctx.sleep("soon").await?;
                Ok(Value::Null)
            })
        });
        match outcome {
            TurnOutcome::Failed(err) => assert_eq!(err.code.as_deref(), Some(codes::INVALID_SPAN)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_is_replaying() {
        let h = history(vec![
            started(),
            scheduled(0, "double"),
            completed(0, serde_json::json!(2)),
        ]);
        let ctx = WorkflowContext::new(Uuid::now_v7(), h);
        assert!(ctx.is_replaying());
        let _first = ctx.step::<Double>(1);
        assert!(!ctx.is_replaying());
    }
}
