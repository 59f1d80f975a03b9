//! Worker pool draining the run queue
//!
//! Handles work items concurrently up to `max_concurrency` with graceful
//! shutdown. A run parked on a sleep or retry timer has no item in flight,
//! so it contributes nothing to [`WorkerPool::current_load`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::{Dispatcher, WorkItem, WorkQueue};
use crate::config::EngineConfig;
use crate::engine::Orchestrator;

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Not running
    Stopped,
    /// Taking items from the queue
    Running,
    /// Finishing in-flight items, taking no new ones
    Draining,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} items in flight")]
    ShutdownTimeout(usize),
}

/// Worker pool handing queued items to the orchestrator
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Dispatcher,
    worker_id: String,
    max_concurrency: usize,
    store_retry_delay: Duration,
    shutdown_timeout: Duration,
    permits: Arc<Semaphore>,
    load: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    status: Mutex<WorkerPoolStatus>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, dispatcher: Dispatcher, config: &EngineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let max_concurrency = config.max_concurrency.max(1);

        Self {
            orchestrator,
            dispatcher,
            worker_id: config.worker_id.clone(),
            max_concurrency,
            store_retry_delay: config.store_retry_delay,
            shutdown_timeout: config.shutdown_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            load: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            status: Mutex::new(WorkerPoolStatus::Stopped),
            loop_handle: Mutex::new(None),
        }
    }

    /// Start draining `queue`
    #[instrument(skip(self, queue), fields(worker_id = %self.worker_id))]
    pub fn start(&self, queue: WorkQueue) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(max_concurrency = self.max_concurrency, "starting worker pool");
        self.shutdown_tx.send_replace(false);

        let handle = tokio::spawn(dispatch_loop(
            queue,
            Arc::clone(&self.orchestrator),
            self.dispatcher.clone(),
            Arc::clone(&self.permits),
            Arc::clone(&self.load),
            self.store_retry_delay,
            self.shutdown_tx.subscribe(),
        ));
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop taking items and wait for in-flight ones to finish
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            let in_flight = self.current_load();
            if in_flight == 0 {
                debug!("all work items finished");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "shutdown timeout reached");
                *self.status.lock() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout(in_flight));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *self.status.lock() = WorkerPoolStatus::Stopped;
        let delayed = self.dispatcher.delayed();
        if delayed > 0 {
            info!(delayed, "work items still delayed at shutdown are left to startup recovery");
        }
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.lock()
    }

    /// Work items being handled right now
    pub fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

async fn dispatch_loop(
    mut queue: WorkQueue,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Dispatcher,
    permits: Arc<Semaphore>,
    load: Arc<AtomicUsize>,
    store_retry_delay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => {
                debug!("dispatch loop: shutdown requested");
                break;
            }
        };

        let item = tokio::select! {
            item = queue.recv() => match item {
                Some(item) => item,
                None => {
                    debug!("dispatch loop: queue closed");
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                debug!("dispatch loop: shutdown requested");
                break;
            }
        };

        load.fetch_add(1, Ordering::SeqCst);
        let orchestrator = Arc::clone(&orchestrator);
        let dispatcher = dispatcher.clone();
        let load = Arc::clone(&load);

        tokio::spawn(async move {
            handle_item(&orchestrator, &dispatcher, item, store_retry_delay).await;
            load.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    debug!("dispatch loop exited");
}

async fn handle_item(
    orchestrator: &Orchestrator,
    dispatcher: &Dispatcher,
    item: WorkItem,
    store_retry_delay: Duration,
) {
    match orchestrator.handle(item).await {
        Ok(()) => {}
        Err(e) if e.is_retryable() => {
            warn!(%item, error = %e, delay_ms = store_retry_delay.as_millis() as u64, "work item failed, retrying");
            dispatcher.enqueue_after(item, store_retry_delay);
        }
        Err(e) => {
            error!(%item, error = %e, "work item failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::engine::WorkflowRegistry;
    use crate::persistence::InMemoryEventStore;
    use crate::step::StepExecutor;
    use crate::timer::TimerService;
    use crate::worker::channel;

    fn pool(store: Arc<InMemoryEventStore>, config: &EngineConfig) -> (WorkerPool, WorkQueue) {
        let (dispatcher, queue) = channel();
        let timers = Arc::new(TimerService::new(store.clone(), dispatcher.clone(), config));
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            timers,
            Arc::new(WorkflowRegistry::new()),
            Arc::new(StepExecutor::new()),
            dispatcher.clone(),
            config.clone(),
        ));
        (WorkerPool::new(orchestrator, dispatcher, config), queue)
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (pool, queue) = pool(Arc::new(InMemoryEventStore::new()), &EngineConfig::default());
        let (_, spare) = channel();

        pool.start(queue).expect("should start");
        assert_eq!(pool.status(), WorkerPoolStatus::Running);
        assert!(matches!(pool.start(spare), Err(WorkerPoolError::AlreadyRunning)));

        pool.shutdown().await.expect("should stop");
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_store_outage_delays_item_past_shutdown() {
        let store = Arc::new(InMemoryEventStore::new());
        let config = EngineConfig::default().with_store_retry_delay(Duration::from_secs(60));
        let (pool, queue) = pool(store.clone(), &config);

        store.set_available(false);
        handle_item(
            &pool.orchestrator,
            &pool.dispatcher,
            WorkItem::Activate {
                run_id: Uuid::now_v7(),
            },
            config.store_retry_delay,
        )
        .await;
        assert_eq!(pool.dispatcher.delayed(), 1);
        assert_eq!(pool.dispatcher.queue_depth(), 0);

        pool.start(queue).expect("should start");
        pool.shutdown()
            .await
            .expect("delayed items do not hold up shutdown");
        assert_eq!(pool.dispatcher.delayed(), 1);
    }
}
