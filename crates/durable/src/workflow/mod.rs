//! Workflow definitions, replay context and history
//!
//! Workflows are deterministic logic over step calls and sleeps. This module provides:
//! - [`Workflow`] trait for defining workflows
//! - [`WorkflowContext`] for issuing durable calls during replay
//! - [`WorkflowEvent`] for history persistence
//! - [`RunHistory`] for reading a run's history per call

mod context;
mod definition;
mod duration;
mod event;
mod history;

pub use context::{Command, Sleep, SleepCall, StepCall, TurnOutcome, WorkflowContext};
pub(crate) use context::run_turn;
pub use definition::{codes, Workflow, WorkflowError};
pub use duration::{parse_span, SpanError};
pub use event::{ResumeToken, WorkflowEvent};
pub use history::{
    CallRecord, HistoricalTimer, HistoryError, PendingRetry, RunHistory, SleepRecord,
    StepAttempt, StepRecord, StepResolution, TerminalEvent,
};
