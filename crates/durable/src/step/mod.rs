//! Step definitions and execution
//!
//! Steps are the side-effecting units of work invoked from workflow logic.
//! Each physical attempt is classified as success, transient failure or
//! permanent failure; the orchestrator records the outcome in history.

mod context;
mod definition;
mod executor;

pub use context::StepContext;
pub use definition::{Step, StepError, StepErrorKind, StepFailure};
pub use executor::{StepExecutor, StepOutcome};
