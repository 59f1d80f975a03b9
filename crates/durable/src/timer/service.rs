//! Durable timer delivery
//!
//! Timers live in the [`TimerStore`]. The service scans for due timers and
//! hands each one to the dispatcher as a `FireTimer` work item. Delivery is
//! at-least-once: a timer emitted but not acknowledged within the
//! redelivery timeout is emitted again, and a process restart re-emits
//! every timer still pending in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::persistence::{StoreError, TimerRecord, TimerStore};
use crate::worker::{Dispatcher, WorkItem};

/// Timer scheduling and delivery
pub struct TimerService {
    store: Arc<dyn TimerStore>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    batch_size: usize,
    redelivery_timeout: Duration,
    /// Timers handed to the dispatcher and not yet acknowledged
    emitted: Mutex<HashMap<Uuid, Instant>>,
    wakeup: Notify,
}

impl TimerService {
    pub fn new(store: Arc<dyn TimerStore>, dispatcher: Dispatcher, config: &EngineConfig) -> Self {
        Self {
            store,
            dispatcher,
            poll_interval: config.timer_poll_interval,
            batch_size: config.timer_batch_size.max(1),
            redelivery_timeout: config.timer_redelivery_timeout,
            emitted: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
        }
    }

    /// Persist a timer and return its id; scheduling a known id again changes nothing
    #[instrument(skip(self, timer), fields(timer_id = %timer.id, run_id = %timer.run_id))]
    pub async fn schedule(&self, timer: &TimerRecord) -> Result<Uuid, StoreError> {
        self.store.upsert_timer(timer).await?;
        trace!(fire_at = %timer.fire_at, "timer scheduled");
        self.wakeup.notify_one();
        Ok(timer.id)
    }

    /// Cancel a pending timer; false if it had already fired or been cancelled
    pub async fn cancel(&self, timer_id: Uuid) -> Result<bool, StoreError> {
        let cancelled = self.store.cancel_timer(timer_id).await?;
        self.emitted.lock().remove(&timer_id);
        Ok(cancelled)
    }

    /// Record that a fired timer was handled so it is never delivered again
    pub async fn acknowledge(&self, timer_id: Uuid) -> Result<(), StoreError> {
        self.store.mark_timer_fired(timer_id).await?;
        self.emitted.lock().remove(&timer_id);
        Ok(())
    }

    /// Timers of a run still pending in the store
    pub async fn pending(&self, run_id: Uuid) -> Result<Vec<TimerRecord>, StoreError> {
        self.store.pending_timers(run_id).await
    }

    /// Allow an emitted timer to be delivered on the next scan
    pub fn release(&self, timer_id: Uuid) {
        self.emitted.lock().remove(&timer_id);
    }

    /// Emit every due timer not already in flight; returns how many were emitted
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let due = self.store.due_timers(Utc::now(), self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let mut emitted = self.emitted.lock();
        let mut count = 0;
        for timer in due {
            if let Some(at) = emitted.get(&timer.id) {
                if now.duration_since(*at) < self.redelivery_timeout {
                    continue;
                }
                debug!(timer_id = %timer.id, "timer not acknowledged, delivering again");
            }
            emitted.insert(timer.id, now);
            self.dispatcher.enqueue(WorkItem::FireTimer {
                run_id: timer.run_id,
                timer_id: timer.id,
            });
            count += 1;
        }
        Ok(count)
    }

    /// Deliver timers until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(poll_interval_ms = self.poll_interval.as_millis() as u64, "timer loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.tick().await {
                Ok(n) if n >= self.batch_size => Duration::ZERO,
                Ok(_) => self.next_wait().await,
                Err(e) => {
                    warn!(error = %e, "timer scan failed");
                    self.poll_interval
                }
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("timer loop exited");
    }

    /// Time until the earliest pending timer, capped at the poll interval
    async fn next_wait(&self) -> Duration {
        match self.store.next_fire_at().await {
            Ok(Some(fire_at)) => match (fire_at - Utc::now()).to_std() {
                Ok(until) if !until.is_zero() => until.min(self.poll_interval),
                // due but already in flight
                _ => self.poll_interval,
            },
            Ok(None) => self.poll_interval,
            Err(e) => {
                warn!(error = %e, "cannot read next timer");
                self.poll_interval
            }
        }
    }

    /// Timers emitted and awaiting acknowledgement
    pub fn in_flight(&self) -> usize {
        self.emitted.lock().len()
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("poll_interval", &self.poll_interval)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
