//! Run queue and worker pool
//!
//! The [`Dispatcher`] is the only way work reaches the orchestrator: new
//! runs, step attempts and fired timers all become [`WorkItem`]s that the
//! [`WorkerPool`] hands out with bounded concurrency.

mod dispatcher;
mod pool;

pub use dispatcher::{channel, Dispatcher, WorkItem, WorkQueue};
pub use pool::{WorkerPool, WorkerPoolError, WorkerPoolStatus};
