//! Workflow execution engine
//!
//! The [`Orchestrator`] replays workflow logic against run history and acts
//! on what it asks for. [`EngineBuilder`] wires it to a store, the worker
//! pool and the timer loop, and [`Engine`] is the API callers hold.

mod locks;
mod orchestrator;
mod registry;
mod runtime;

pub use orchestrator::{EngineError, Orchestrator};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use runtime::{Engine, EngineBuilder};
