//! Store traits: the durable run log and the timer table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ResumeToken, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Run already exists
    #[error("run already exists: {0}")]
    RunAlreadyExists(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Unavailable(_) | Self::Database(_)
        )
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Enqueued, never activated
    Pending,

    /// Workflow logic is being replayed
    Running,

    /// Waiting on a step result or a timer; holds no compute
    Suspended,

    /// Workflow logic returned a value
    Completed,

    /// Workflow logic returned an error or diverged
    Failed,

    /// Cancelled by a caller
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Run metadata stored alongside the history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One appended event with its position in the run history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Position in the run history (0-based, gapless)
    pub sequence: i64,
    pub event: WorkflowEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Filter for listing runs
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub workflow_type: Option<String>,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            workflow_type: None,
            limit: 100,
        }
    }
}

impl RunFilter {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, run: &RunInfo) -> bool {
        self.status.map_or(true, |s| s == run.status)
            && self
                .workflow_type
                .as_deref()
                .map_or(true, |t| t == run.workflow_type)
    }
}

/// Timer lifecycle in the timer table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Fired,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A durable timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub fire_at: DateTime<Utc>,
    pub resume: ResumeToken,
}

/// Durable, append-only run log
///
/// The history is the single source of truth for replay. Implementations
/// must be thread-safe, must return events in append order, and must make
/// every `append_events` batch atomic.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a new run in `Pending` status with an empty history
    async fn create_run(
        &self,
        run_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Get run metadata
    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError>;

    /// List runs, newest first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunInfo>, StoreError>;

    /// List every run that is not in a terminal status
    async fn list_active_runs(&self) -> Result<Vec<RunInfo>, StoreError>;

    /// Update the status projection of a run
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append events if the history still has `expected_sequence` entries
    ///
    /// Returns the new history length. Fails with `ConcurrencyConflict` when
    /// another writer appended first; nothing is written in that case.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError>;

    /// Load the full history (for replay and inspection)
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Durable timer table used by the timer service
#[async_trait]
pub trait TimerStore: Send + Sync + 'static {
    /// Insert a pending timer; a no-op if the id is already known
    async fn upsert_timer(&self, timer: &TimerRecord) -> Result<(), StoreError>;

    /// Cancel a pending timer; returns false if it was not pending
    async fn cancel_timer(&self, timer_id: Uuid) -> Result<bool, StoreError>;

    /// Mark a timer fired once its `TimerFired` event is recorded
    async fn mark_timer_fired(&self, timer_id: Uuid) -> Result<(), StoreError>;

    /// Pending timers with `fire_at <= now`, earliest first
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError>;

    /// Earliest `fire_at` among pending timers
    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Pending timers belonging to a run
    async fn pending_timers(&self, run_id: Uuid) -> Result<Vec<TimerRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Suspended,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_filter_matches() {
        let run = RunInfo {
            id: Uuid::now_v7(),
            workflow_type: "user_signup".into(),
            status: RunStatus::Suspended,
            input: serde_json::json!({}),
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(RunFilter::default().matches(&run));
        assert!(RunFilter::default()
            .with_status(RunStatus::Suspended)
            .matches(&run));
        assert!(!RunFilter::default()
            .with_status(RunStatus::Completed)
            .matches(&run));
        assert!(!RunFilter::default()
            .with_workflow_type("other")
            .matches(&run));
    }

    #[test]
    fn test_transient_store_errors() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::ConcurrencyConflict {
            expected: 1,
            actual: 2
        }
        .is_transient());
        assert!(!StoreError::RunNotFound(Uuid::now_v7()).is_transient());
    }
}
