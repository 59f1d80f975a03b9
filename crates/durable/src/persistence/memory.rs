//! In-memory implementation of the stores for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{WorkflowError, WorkflowEvent};

/// Internal run state
struct RunState {
    info: RunInfo,
    events: Vec<HistoryEntry>,
}

/// Internal timer state
struct TimerState {
    record: TimerRecord,
    status: TimerStatus,
}

/// In-memory implementation of [`EventStore`] and [`TimerStore`]
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation. Share one
/// instance between two engines to simulate a process restart.
///
/// # Example
///
/// ```
/// use flowline_durable::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// ```
pub struct InMemoryEventStore {
    runs: RwLock<HashMap<Uuid, RunState>>,
    timers: RwLock<HashMap<Uuid, TimerState>>,
    available: AtomicBool,
}

impl InMemoryEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Get the number of pending timers
    pub fn pending_timer_count(&self) -> usize {
        self.timers
            .read()
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .count()
    }

    /// Status of a timer in the timer table
    pub fn timer_status(&self, timer_id: Uuid) -> Option<TimerStatus> {
        self.timers.read().get(&timer_id).map(|t| t.status)
    }

    /// Simulate an outage: while unavailable every operation fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.timers.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create_run(
        &self,
        run_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut runs = self.runs.write();
        if runs.contains_key(&run_id) {
            return Err(StoreError::RunAlreadyExists(run_id));
        }

        let now = Utc::now();
        runs.insert(
            run_id,
            RunState {
                info: RunInfo {
                    id: run_id,
                    workflow_type: workflow_type.to_string(),
                    status: RunStatus::Pending,
                    input,
                    result: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
                events: vec![],
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunInfo, StoreError> {
        self.check_available()?;
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunInfo>, StoreError> {
        self.check_available()?;
        let runs = self.runs.read();
        let mut matching: Vec<RunInfo> = runs
            .values()
            .map(|r| &r.info)
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        // v7 ids sort by creation time
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        matching.truncate(filter.limit);
        Ok(matching)
    }

    async fn list_active_runs(&self) -> Result<Vec<RunInfo>, StoreError> {
        self.check_available()?;
        let runs = self.runs.read();
        let mut active: Vec<RunInfo> = runs
            .values()
            .filter(|r| !r.info.status.is_terminal())
            .map(|r| r.info.clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        run.info.status = status;
        if result.is_some() {
            run.info.result = result;
        }
        if error.is_some() {
            run.info.error = error;
        }
        run.info.updated_at = Utc::now();
        Ok(())
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current = run.events.len() as i64;
        if current != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        let recorded_at = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            run.events.push(HistoryEntry {
                sequence: current + offset as i64,
                event,
                recorded_at,
            });
        }
        run.info.updated_at = recorded_at;

        Ok(run.events.len() as i64)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        self.check_available()?;
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }
}

#[async_trait]
impl TimerStore for InMemoryEventStore {
    async fn upsert_timer(&self, timer: &TimerRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.timers
            .write()
            .entry(timer.id)
            .or_insert_with(|| TimerState {
                record: timer.clone(),
                status: TimerStatus::Pending,
            });
        Ok(())
    }

    async fn cancel_timer(&self, timer_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut timers = self.timers.write();
        match timers.get_mut(&timer_id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.status = TimerStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_timer_fired(&self, timer_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(timer) = self.timers.write().get_mut(&timer_id) {
            if timer.status == TimerStatus::Pending {
                timer.status = TimerStatus::Fired;
            }
        }
        Ok(())
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        self.check_available()?;
        let timers = self.timers.read();
        let mut due: Vec<TimerRecord> = timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending && t.record.fire_at <= now)
            .map(|t| t.record.clone())
            .collect();
        due.sort_by_key(|t| t.fire_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_available()?;
        Ok(self
            .timers
            .read()
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .map(|t| t.record.fire_at)
            .min())
    }

    async fn pending_timers(&self, run_id: Uuid) -> Result<Vec<TimerRecord>, StoreError> {
        self.check_available()?;
        let timers = self.timers.read();
        let mut pending: Vec<TimerRecord> = timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending && t.record.run_id == run_id)
            .map(|t| t.record.clone())
            .collect();
        pending.sort_by_key(|t| t.fire_at);
        Ok(pending)
    }
}
