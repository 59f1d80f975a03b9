//! Projection of a run's event log into per-call state
//!
//! Replay and dispatch both read history through [`RunHistory`]: which calls
//! were issued, which are resolved, which timers are pending and how many
//! physical attempts each step received.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{ResumeToken, WorkflowError, WorkflowEvent};
use crate::persistence::{HistoryEntry, RunStatus};
use crate::reliability::RetryPolicy;
use crate::step::StepError;

/// History that cannot be projected (missing or out-of-order events)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("corrupt history at sequence {sequence}: {reason}")]
pub struct HistoryError {
    pub sequence: i64,
    pub reason: String,
}

/// Recorded resolution of a step call
#[derive(Debug, Clone, PartialEq)]
pub enum StepResolution {
    Completed(Value),
    Failed(StepError),
}

/// One physical attempt, from its `StepStarted` to its outcome
#[derive(Debug, Clone, PartialEq)]
pub struct StepAttempt {
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<StepResolution>,
}

/// A retry waiting on its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRetry {
    pub timer_id: Uuid,
    pub attempt: u32,
}

/// Everything recorded about one step call
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub call_id: u32,
    pub step_name: String,
    pub input: Value,
    pub retry_policy: RetryPolicy,
    pub attempts: Vec<StepAttempt>,
    /// Highest attempt number with a recorded outcome
    pub last_recorded_attempt: u32,
    pub resolution: Option<StepResolution>,
    pub pending_retry: Option<PendingRetry>,
}

impl StepRecord {
    /// Number of physical invocations recorded for this call
    pub fn invocations(&self) -> usize {
        self.attempts.len()
    }

    /// Attempt to run next, if the call is neither resolved nor waiting on a retry timer
    pub fn next_attempt(&self) -> Option<u32> {
        if self.resolution.is_some() || self.pending_retry.is_some() {
            None
        } else {
            Some(self.last_recorded_attempt + 1)
        }
    }
}

/// Everything recorded about one sleep call
#[derive(Debug, Clone, PartialEq)]
pub struct SleepRecord {
    pub call_id: u32,
    pub timer_id: Uuid,
    pub duration_ms: u64,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
}

/// A call issued by workflow logic, keyed by call id
#[derive(Debug, Clone, PartialEq)]
pub enum CallRecord {
    Step(StepRecord),
    Sleep(SleepRecord),
}

impl CallRecord {
    pub fn describe(&self) -> String {
        match self {
            Self::Step(step) => format!("step '{}'", step.step_name),
            Self::Sleep(sleep) => format!("sleep of {}ms", sleep.duration_ms),
        }
    }
}

/// Timer as seen from history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalTimer {
    pub fire_at: DateTime<Utc>,
    pub resume: ResumeToken,
    pub fired: bool,
    pub cancelled: bool,
}

impl HistoricalTimer {
    pub fn is_pending(&self) -> bool {
        !self.fired && !self.cancelled
    }
}

/// How the history ended, if it did
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Completed(Value),
    Failed(WorkflowError),
    Cancelled(String),
}

impl TerminalEvent {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed(_) => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
            Self::Cancelled(_) => RunStatus::Cancelled,
        }
    }
}

/// Projection of a run's history
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    workflow_type: Option<String>,
    input: Value,
    calls: BTreeMap<u32, CallRecord>,
    timers: HashMap<Uuid, HistoricalTimer>,
    terminal: Option<TerminalEvent>,
    len: i64,
}

impl RunHistory {
    /// Build the projection, validating event references along the way
    pub fn from_entries(entries: &[HistoryEntry]) -> Result<Self, HistoryError> {
        let mut history = Self::default();
        for entry in entries {
            history.apply(entry)?;
        }
        Ok(history)
    }

    fn apply(&mut self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let corrupt = |reason: String| HistoryError {
            sequence: entry.sequence,
            reason,
        };

        if entry.sequence != self.len {
            return Err(corrupt(format!("expected sequence {}", self.len)));
        }
        self.len += 1;

        if self.terminal.is_some() {
            return Err(corrupt("event recorded after terminal event".into()));
        }
        if self.workflow_type.is_none() && !matches!(entry.event, WorkflowEvent::RunStarted { .. }) {
            return Err(corrupt("history does not begin with run_started".into()));
        }

        match &entry.event {
            WorkflowEvent::RunStarted {
                workflow_type,
                input,
            } => {
                if self.workflow_type.is_some() {
                    return Err(corrupt("duplicate run_started".into()));
                }
                self.workflow_type = Some(workflow_type.clone());
                self.input = input.clone();
            }
            WorkflowEvent::RunCompleted { result } => {
                self.terminal = Some(TerminalEvent::Completed(result.clone()));
            }
            WorkflowEvent::RunFailed { error } => {
                self.terminal = Some(TerminalEvent::Failed(error.clone()));
            }
            WorkflowEvent::RunCancelled { reason } => {
                self.terminal = Some(TerminalEvent::Cancelled(reason.clone()));
            }
            WorkflowEvent::StepScheduled {
                call_id,
                step_name,
                input,
                retry_policy,
            } => {
                if self.calls.contains_key(call_id) {
                    return Err(corrupt(format!("call {call_id} scheduled twice")));
                }
                self.calls.insert(
                    *call_id,
                    CallRecord::Step(StepRecord {
                        call_id: *call_id,
                        step_name: step_name.clone(),
                        input: input.clone(),
                        retry_policy: retry_policy.clone(),
                        attempts: vec![],
                        last_recorded_attempt: 0,
                        resolution: None,
                        pending_retry: None,
                    }),
                );
            }
            WorkflowEvent::StepStarted {
                call_id,
                attempt,
                worker_id,
            } => {
                let step = self.step_mut(*call_id).ok_or_else(|| {
                    corrupt(format!("step_started for unknown call {call_id}"))
                })?;
                step.attempts.push(StepAttempt {
                    attempt: *attempt,
                    worker_id: worker_id.clone(),
                    started_at: entry.recorded_at,
                    finished_at: None,
                    outcome: None,
                });
            }
            WorkflowEvent::StepCompleted {
                call_id,
                attempt,
                result,
            } => {
                let step = self.step_mut(*call_id).ok_or_else(|| {
                    corrupt(format!("step_completed for unknown call {call_id}"))
                })?;
                let resolution = StepResolution::Completed(result.clone());
                record_outcome(step, *attempt, resolution.clone(), entry.recorded_at);
                step.resolution = Some(resolution);
            }
            WorkflowEvent::StepFailed {
                call_id,
                attempt,
                error,
                will_retry,
            } => {
                let step = self.step_mut(*call_id).ok_or_else(|| {
                    corrupt(format!("step_failed for unknown call {call_id}"))
                })?;
                let resolution = StepResolution::Failed(error.clone());
                record_outcome(step, *attempt, resolution.clone(), entry.recorded_at);
                if !will_retry {
                    step.resolution = Some(resolution);
                }
            }
            WorkflowEvent::TimerScheduled {
                timer_id,
                fire_at,
                resume,
            } => {
                if self.timers.contains_key(timer_id) {
                    return Err(corrupt(format!("timer {timer_id} scheduled twice")));
                }
                match resume {
                    ResumeToken::Sleep {
                        call_id,
                        duration_ms,
                    } => {
                        if self.calls.contains_key(call_id) {
                            return Err(corrupt(format!("call {call_id} scheduled twice")));
                        }
                        self.calls.insert(
                            *call_id,
                            CallRecord::Sleep(SleepRecord {
                                call_id: *call_id,
                                timer_id: *timer_id,
                                duration_ms: *duration_ms,
                                fire_at: *fire_at,
                                fired: false,
                            }),
                        );
                    }
                    ResumeToken::StepRetry { call_id, attempt } => {
                        let step = self.step_mut(*call_id).ok_or_else(|| {
                            corrupt(format!("retry timer for unknown call {call_id}"))
                        })?;
                        step.pending_retry = Some(PendingRetry {
                            timer_id: *timer_id,
                            attempt: *attempt,
                        });
                    }
                }
                self.timers.insert(
                    *timer_id,
                    HistoricalTimer {
                        fire_at: *fire_at,
                        resume: resume.clone(),
                        fired: false,
                        cancelled: false,
                    },
                );
            }
            WorkflowEvent::TimerFired { timer_id } => {
                let timer = self
                    .timers
                    .get_mut(timer_id)
                    .ok_or_else(|| corrupt(format!("timer_fired for unknown timer {timer_id}")))?;
                timer.fired = true;
                let resume = timer.resume.clone();
                match resume {
                    ResumeToken::Sleep { call_id, .. } => {
                        if let Some(CallRecord::Sleep(sleep)) = self.calls.get_mut(&call_id) {
                            sleep.fired = true;
                        }
                    }
                    ResumeToken::StepRetry { call_id, .. } => {
                        if let Some(step) = self.step_mut(call_id) {
                            step.pending_retry = None;
                        }
                    }
                }
            }
            WorkflowEvent::TimerCancelled { timer_id } => {
                let timer = self.timers.get_mut(timer_id).ok_or_else(|| {
                    corrupt(format!("timer_cancelled for unknown timer {timer_id}"))
                })?;
                timer.cancelled = true;
            }
        }
        Ok(())
    }

    fn step_mut(&mut self, call_id: u32) -> Option<&mut StepRecord> {
        match self.calls.get_mut(&call_id) {
            Some(CallRecord::Step(step)) => Some(step),
            _ => None,
        }
    }

    /// Workflow type from `RunStarted`
    pub fn workflow_type(&self) -> Option<&str> {
        self.workflow_type.as_deref()
    }

    /// Run input from `RunStarted`
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Number of events; the expected sequence for the next append
    pub fn next_sequence(&self) -> i64 {
        self.len
    }

    pub fn call(&self, call_id: u32) -> Option<&CallRecord> {
        self.calls.get(&call_id)
    }

    /// Calls in call-id order
    pub fn calls(&self) -> impl Iterator<Item = &CallRecord> {
        self.calls.values()
    }

    pub fn call_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.calls.keys().copied()
    }

    pub fn step(&self, call_id: u32) -> Option<&StepRecord> {
        match self.calls.get(&call_id) {
            Some(CallRecord::Step(step)) => Some(step),
            _ => None,
        }
    }

    /// Step calls in call-id order
    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.calls.values().filter_map(|call| match call {
            CallRecord::Step(step) => Some(step),
            CallRecord::Sleep(_) => None,
        })
    }

    pub fn timer(&self, timer_id: Uuid) -> Option<&HistoricalTimer> {
        self.timers.get(&timer_id)
    }

    /// Timers neither fired nor cancelled
    pub fn pending_timers(&self) -> impl Iterator<Item = (Uuid, &HistoricalTimer)> {
        self.timers
            .iter()
            .filter(|(_, t)| t.is_pending())
            .map(|(id, t)| (*id, t))
    }

    pub fn terminal(&self) -> Option<&TerminalEvent> {
        self.terminal.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Total physical invocations of a step across all its calls
    pub fn invocations_of(&self, step_name: &str) -> usize {
        self.steps()
            .filter(|s| s.step_name == step_name)
            .map(StepRecord::invocations)
            .sum()
    }
}

fn record_outcome(
    step: &mut StepRecord,
    attempt: u32,
    outcome: StepResolution,
    recorded_at: DateTime<Utc>,
) {
    step.last_recorded_attempt = step.last_recorded_attempt.max(attempt);
    if let Some(record) = step
        .attempts
        .iter_mut()
        .rev()
        .find(|a| a.attempt == attempt && a.outcome.is_none())
    {
        record.finished_at = Some(recorded_at);
        record.outcome = Some(outcome);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a gapless history from bare events
    pub(crate) fn entries(events: Vec<WorkflowEvent>) -> Vec<HistoryEntry> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| HistoryEntry {
                sequence: i as i64,
                event,
                recorded_at: Utc::now(),
            })
            .collect()
    }

    pub(crate) fn started() -> WorkflowEvent {
        WorkflowEvent::RunStarted {
            workflow_type: "test".into(),
            input: serde_json::json!(null),
        }
    }

    pub(crate) fn scheduled(call_id: u32, step_name: &str) -> WorkflowEvent {
        WorkflowEvent::StepScheduled {
            call_id,
            step_name: step_name.into(),
            input: serde_json::json!(null),
            retry_policy: RetryPolicy::fixed(std::time::Duration::from_millis(10), 3),
        }
    }

    fn step_started(call_id: u32, attempt: u32) -> WorkflowEvent {
        WorkflowEvent::StepStarted {
            call_id,
            attempt,
            worker_id: "w1".into(),
        }
    }

    #[test]
    fn test_retry_cycle_projection() {
        let retry_timer = Uuid::now_v7();
        let history = RunHistory::from_entries(&entries(vec![
            started(),
            scheduled(0, "send_welcome_email"),
            step_started(0, 1),
            WorkflowEvent::StepFailed {
                call_id: 0,
                attempt: 1,
                error: StepError::transient("smtp"),
                will_retry: true,
            },
            WorkflowEvent::TimerScheduled {
                timer_id: retry_timer,
                fire_at: Utc::now(),
                resume: ResumeToken::StepRetry {
                    call_id: 0,
                    attempt: 2,
                },
            },
        ]))
        .expect("should project");

        let step = history.step(0).expect("step 0");
        assert_eq!(step.invocations(), 1);
        assert_eq!(step.last_recorded_attempt, 1);
        assert!(step.resolution.is_none());
        assert_eq!(
            step.pending_retry,
            Some(PendingRetry {
                timer_id: retry_timer,
                attempt: 2
            })
        );
        assert_eq!(step.next_attempt(), None);
        assert_eq!(history.pending_timers().count(), 1);
        assert_eq!(history.next_sequence(), 5);
    }

    #[test]
    fn test_resolved_step_after_retry() {
        let retry_timer = Uuid::now_v7();
        let history = RunHistory::from_entries(&entries(vec![
            started(),
            scheduled(0, "send_welcome_email"),
            step_started(0, 1),
            WorkflowEvent::StepFailed {
                call_id: 0,
                attempt: 1,
                error: StepError::transient("smtp"),
                will_retry: true,
            },
            WorkflowEvent::TimerScheduled {
                timer_id: retry_timer,
                fire_at: Utc::now(),
                resume: ResumeToken::StepRetry {
                    call_id: 0,
                    attempt: 2,
                },
            },
            WorkflowEvent::TimerFired {
                timer_id: retry_timer,
            },
            step_started(0, 2),
            WorkflowEvent::StepCompleted {
                call_id: 0,
                attempt: 2,
                result: serde_json::json!("ok"),
            },
        ]))
        .expect("should project");

        let step = history.step(0).expect("step 0");
        assert_eq!(
            step.resolution,
            Some(StepResolution::Completed(serde_json::json!("ok")))
        );
        assert_eq!(step.invocations(), 2);
        assert!(step.attempts.iter().all(|a| a.outcome.is_some()));
        assert_eq!(history.invocations_of("send_welcome_email"), 2);
        assert_eq!(history.pending_timers().count(), 0);
    }

    #[test]
    fn test_unstarted_step_needs_first_attempt() {
        let history =
            RunHistory::from_entries(&entries(vec![started(), scheduled(0, "create_user")]))
                .unwrap();
        assert_eq!(history.step(0).unwrap().next_attempt(), Some(1));
    }

    #[test]
    fn test_sleep_projection() {
        let timer_id = Uuid::now_v7();
        let history = RunHistory::from_entries(&entries(vec![
            started(),
            WorkflowEvent::TimerScheduled {
                timer_id,
                fire_at: Utc::now(),
                resume: ResumeToken::Sleep {
                    call_id: 0,
                    duration_ms: 5000,
                },
            },
            WorkflowEvent::TimerFired { timer_id },
        ]))
        .unwrap();

        match history.call(0) {
            Some(CallRecord::Sleep(sleep)) => {
                assert!(sleep.fired);
                assert_eq!(sleep.duration_ms, 5000);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(history.timer(timer_id).is_some_and(|t| t.fired));
    }

    #[test]
    fn test_terminal_projection() {
        let history = RunHistory::from_entries(&entries(vec![
            started(),
            WorkflowEvent::RunCompleted {
                result: serde_json::json!({"ok": true}),
            },
        ]))
        .unwrap();
        assert!(history.is_terminal());
        assert_eq!(
            history.terminal().map(TerminalEvent::status),
            Some(RunStatus::Completed)
        );
    }

    #[test]
    fn test_corrupt_histories() {
        let err = RunHistory::from_entries(&entries(vec![scheduled(0, "x")])).unwrap_err();
        assert_eq!(err.sequence, 0);

        let err = RunHistory::from_entries(&entries(vec![started(), step_started(3, 1)]))
            .unwrap_err();
        assert!(err.reason.contains("unknown call 3"));

        let err = RunHistory::from_entries(&entries(vec![
            started(),
            WorkflowEvent::RunCancelled {
                reason: "x".into(),
            },
            scheduled(0, "x"),
        ]))
        .unwrap_err();
        assert!(err.reason.contains("after terminal"));

        let mut gapped = entries(vec![started(), scheduled(0, "x")]);
        gapped[1].sequence = 5;
        assert!(RunHistory::from_entries(&gapped).is_err());
    }
}
