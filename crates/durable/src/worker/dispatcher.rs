//! Run queue feeding the worker pool
//!
//! Every unit of work is a [`WorkItem`]. Producers (enqueue, step
//! completion, timer fire) hold a cloneable [`Dispatcher`]; the worker pool
//! owns the single [`WorkQueue`]. Delivery is at-least-once: history
//! de-duplicates, so handlers treat repeats as no-ops.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// A unit of work for the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// Replay the run and act on what the logic asks for
    Activate { run_id: Uuid },

    /// Run one physical attempt of a step call
    ExecuteStep {
        run_id: Uuid,
        call_id: u32,
        attempt: u32,
    },

    /// Record a due timer and resume what it was guarding
    FireTimer { run_id: Uuid, timer_id: Uuid },
}

impl WorkItem {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Activate { run_id }
            | Self::ExecuteStep { run_id, .. }
            | Self::FireTimer { run_id, .. } => *run_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::ExecuteStep { .. } => "execute_step",
            Self::FireTimer { .. } => "fire_timer",
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate { run_id } => write!(f, "activate({run_id})"),
            Self::ExecuteStep {
                run_id,
                call_id,
                attempt,
            } => write!(f, "execute_step({run_id}, call {call_id}, attempt {attempt})"),
            Self::FireTimer { run_id, timer_id } => write!(f, "fire_timer({run_id}, {timer_id})"),
        }
    }
}

/// Create a connected dispatcher and queue
pub fn channel() -> (Dispatcher, WorkQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        Dispatcher {
            tx,
            depth: Arc::clone(&depth),
            delayed: Arc::new(AtomicUsize::new(0)),
        },
        WorkQueue { rx, depth },
    )
}

/// Producer side of the run queue
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
    depth: Arc<AtomicUsize>,
    /// Items waiting out an `enqueue_after` delay
    delayed: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Queue an item; returns without waiting for it to be handled
    pub fn enqueue(&self, item: WorkItem) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(%item, "run queue closed, dropping work item");
        }
    }

    /// Queue an item after `delay` without occupying a worker slot
    ///
    /// The wait is not durable: an item still delayed when the process stops
    /// is lost, and startup recovery rebuilds it from run history.
    pub fn enqueue_after(&self, item: WorkItem, delay: Duration) {
        let dispatcher = self.clone();
        self.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.delayed.fetch_sub(1, Ordering::SeqCst);
            dispatcher.enqueue(item);
        });
    }

    /// Items waiting to be queued after a delay
    pub fn delayed(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }

    /// Items queued but not yet taken by a worker
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_depth", &self.queue_depth())
            .field("delayed", &self.delayed())
            .finish()
    }
}

/// Consumer side of the run queue
pub struct WorkQueue {
    rx: mpsc::UnboundedReceiver<WorkItem>,
    depth: Arc<AtomicUsize>,
}

impl WorkQueue {
    /// Wait for the next item; `None` once every dispatcher is dropped
    pub async fn recv(&mut self) -> Option<WorkItem> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Take the next item if one is queued
    pub fn try_recv(&mut self) -> Option<WorkItem> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_depth() {
        let (dispatcher, mut queue) = channel();
        let run_id = Uuid::now_v7();

        dispatcher.enqueue(WorkItem::Activate { run_id });
        dispatcher.enqueue(WorkItem::ExecuteStep {
            run_id,
            call_id: 0,
            attempt: 1,
        });
        assert_eq!(dispatcher.queue_depth(), 2);

        assert_eq!(queue.recv().await, Some(WorkItem::Activate { run_id }));
        assert_eq!(dispatcher.queue_depth(), 1);
        assert!(matches!(
            queue.try_recv(),
            Some(WorkItem::ExecuteStep { call_id: 0, .. })
        ));
        assert_eq!(queue.try_recv(), None);
        assert_eq!(dispatcher.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_delay() {
        let (dispatcher, mut queue) = channel();
        let run_id = Uuid::now_v7();

        dispatcher.enqueue_after(WorkItem::Activate { run_id }, Duration::from_millis(20));
        assert_eq!(queue.try_recv(), None);
        assert_eq!(dispatcher.delayed(), 1);
        assert_eq!(dispatcher.queue_depth(), 0);

        let item = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("should arrive");
        assert_eq!(item, Some(WorkItem::Activate { run_id }));
        assert_eq!(dispatcher.delayed(), 0);
    }

    #[test]
    fn test_enqueue_on_closed_queue_is_dropped() {
        let (dispatcher, queue) = channel();
        drop(queue);
        dispatcher.enqueue(WorkItem::Activate {
            run_id: Uuid::now_v7(),
        });
        assert_eq!(dispatcher.queue_depth(), 0);
    }

    #[test]
    fn test_display() {
        let run_id = Uuid::nil();
        let item = WorkItem::ExecuteStep {
            run_id,
            call_id: 2,
            attempt: 3,
        };
        assert_eq!(item.kind(), "execute_step");
        assert_eq!(item.run_id(), run_id);
        assert!(item.to_string().contains("attempt 3"));
    }
}
