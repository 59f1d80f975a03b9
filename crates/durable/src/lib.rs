//! # Durable Execution Engine
//!
//! Workflows written as ordinary async Rust whose progress survives process
//! restarts, with retried steps and durable sleeps.
//!
//! ## Features
//!
//! - **Replayed workflows**: every step result, failure and timer is appended to
//!   the run's history; workflow logic is re-run against that history to resume
//! - **Automatic retries**: configurable retry policies with exponential backoff
//!   and jitter; fatal errors short-circuit the policy
//! - **Durable sleeps**: a suspended run holds no worker while it waits
//! - **Pluggable storage**: in-memory for tests, PostgreSQL for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (start / cancel / inspect runs)                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Dispatcher ──► WorkerPool                       │
//! │  (run queue: activate, execute step, fire timer)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                            │
//! │  (replays workflow logic, records step outcomes)            │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │       EventStore          │   │   TimerService / TimerStore   │
//! │  (append-only histories)  │   │  (sleeps and retry backoff)   │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowline_durable::prelude::*;
//!
//! struct UserSignup;
//!
//! #[async_trait]
//! impl Workflow for UserSignup {
//!     const TYPE: &'static str = "user_signup";
//!     type Input = String;
//!     type Output = serde_json::Value;
//!
//!     async fn run(&self, ctx: WorkflowContext, email: String) -> Result<Self::Output, WorkflowError> {
//!         let user = ctx.step::<CreateUser>(email).await?;
//!         ctx.step::<SendWelcomeEmail>(user.clone()).await?;
//!         ctx.sleep("5s").await?;
//!         ctx.step::<SendOnboardingEmail>(user.clone()).await?;
//!         Ok(json!({ "user_id": user.id, "status": "onboarded" }))
//!     }
//! }
//!
//! let engine = EngineBuilder::new(Arc::new(InMemoryEventStore::new()))
//!     .workflow(UserSignup)
//!     .step(CreateUser)
//!     .step(SendWelcomeEmail)
//!     .step(SendOnboardingEmail)
//!     .start()
//!     .await?;
//! let run_id = engine.start_workflow::<UserSignup>("ada@example.com".into()).await?;
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod step;
pub mod timer;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder, EngineError};
    pub use crate::persistence::{
        EventStore, InMemoryEventStore, PostgresEventStore, RunFilter, RunInfo, RunStatus,
        StoreError, TimerStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{Step, StepContext, StepError};
    pub use crate::workflow::{Workflow, WorkflowContext, WorkflowError, WorkflowEvent};
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineError, WorkflowRegistry};
pub use persistence::{
    EventStore, HistoryEntry, InMemoryEventStore, PostgresEventStore, RunFilter, RunInfo,
    RunStatus, StoreError, TimerRecord, TimerStore,
};
pub use reliability::{FailureClass, RetryDecision, RetryPolicy};
pub use step::{Step, StepContext, StepError, StepErrorKind, StepFailure};
pub use workflow::{
    RunHistory, TurnOutcome, Workflow, WorkflowContext, WorkflowError, WorkflowEvent,
};
