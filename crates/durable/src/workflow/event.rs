//! Run history events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowError;
use crate::reliability::RetryPolicy;
use crate::step::StepError;

/// Where a run continues when a timer fires
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeToken {
    /// Wake the workflow logic suspended on a `sleep` call
    Sleep { call_id: u32, duration_ms: u64 },

    /// Start the given attempt of a step call
    StepRetry { call_id: u32, attempt: u32 },
}

impl ResumeToken {
    pub fn call_id(&self) -> u32 {
        match self {
            Self::Sleep { call_id, .. } | Self::StepRetry { call_id, .. } => *call_id,
        }
    }
}

/// Events stored in a run's history
///
/// These events form the append-only log for a run. They are used for:
/// - Persisting run progress
/// - Replaying workflow logic after suspension or recovery
/// - Inspection and debugging
///
/// Events are immutable once written. Step and sleep calls are identified by
/// `call_id`, their position in the sequence of calls issued by the logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Run Lifecycle Events
    // =========================================================================
    /// Run was enqueued with the given input
    RunStarted {
        workflow_type: String,
        input: serde_json::Value,
    },

    /// Workflow logic returned a value
    RunCompleted { result: serde_json::Value },

    /// Workflow logic returned an error, or replay diverged
    RunFailed { error: WorkflowError },

    /// Run was cancelled by an operator or caller
    RunCancelled { reason: String },

    // =========================================================================
    // Step Events
    // =========================================================================
    /// Workflow logic issued a new step call
    StepScheduled {
        call_id: u32,
        step_name: String,
        input: serde_json::Value,
        /// Policy in force for this call
        retry_policy: RetryPolicy,
    },

    /// A physical attempt of a step call began
    StepStarted {
        call_id: u32,
        attempt: u32,
        worker_id: String,
    },

    /// A step attempt returned normally
    StepCompleted {
        call_id: u32,
        attempt: u32,
        result: serde_json::Value,
    },

    /// A step attempt failed
    StepFailed {
        call_id: u32,
        attempt: u32,
        error: StepError,
        /// If false, this failure is terminal for the call
        will_retry: bool,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// A durable timer was scheduled
    TimerScheduled {
        timer_id: Uuid,
        fire_at: DateTime<Utc>,
        resume: ResumeToken,
    },

    /// A durable timer fired
    TimerFired { timer_id: Uuid },

    /// A pending timer was cancelled with its run
    TimerCancelled { timer_id: Uuid },
}

impl WorkflowEvent {
    /// Get the event type as a string (matches the serialized tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::StepScheduled { .. } => "step_scheduled",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::TimerScheduled { .. } => "timer_scheduled",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
        }
    }

    /// Get the call id if this is a step event
    pub fn call_id(&self) -> Option<u32> {
        match self {
            Self::StepScheduled { call_id, .. }
            | Self::StepStarted { call_id, .. }
            | Self::StepCompleted { call_id, .. }
            | Self::StepFailed { call_id, .. } => Some(*call_id),
            Self::TimerScheduled { resume, .. } => Some(resume.call_id()),
            _ => None,
        }
    }

    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}
