//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`EventStore`] for run metadata and append-only histories
//! - [`TimerStore`] for durable timers
//! - [`InMemoryEventStore`] for tests and single-process use
//! - [`PostgresEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{
    EventStore, HistoryEntry, RunFilter, RunInfo, RunStatus, StoreError, TimerRecord,
    TimerStatus, TimerStore,
};
