//! Workflow registry for type-erased workflow execution
//!
//! The registry maps workflow type names to workflow logic that takes and
//! returns JSON, so the orchestrator can replay a run knowing only the
//! type name stored in its history.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::workflow::{codes, Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow interface
///
/// All inputs and outputs are JSON.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Run the workflow logic against a replay context
    fn run<'a>(
        &'a self,
        ctx: WorkflowContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn run<'a>(
        &'a self,
        ctx: WorkflowContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        async move {
            let input: W::Input = serde_json::from_value(input).map_err(|e| {
                WorkflowError::new(format!("invalid input for {}: {e}", W::TYPE))
                    .with_code(codes::INVALID_INPUT)
            })?;
            let output = self.inner.run(ctx, input).await?;
            serde_json::to_value(output).map_err(|e| {
                WorkflowError::new(format!("cannot serialize output of {}: {e}", W::TYPE))
                    .with_code(codes::SERIALIZATION)
            })
        }
        .boxed()
    }
}

/// Registry of workflow logic keyed by type name
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// Registering the same type twice replaces the earlier logic.
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        self.workflows
            .insert(W::TYPE.to_string(), Arc::new(WorkflowWrapper { inner: workflow }));
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Look up the logic for a workflow type
    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        self.workflows
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::HistoryEntry;
    use crate::workflow::{run_turn, RunHistory, TurnOutcome, WorkflowEvent};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestInput {
        value: i32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct TestOutput {
        result: i32,
    }

    struct TestWorkflow;

    #[async_trait]
    impl Workflow for TestWorkflow {
        const TYPE: &'static str = "test_workflow";
        type Input = TestInput;
        type Output = TestOutput;

        async fn run(
            &self,
            _ctx: WorkflowContext,
            input: TestInput,
        ) -> Result<TestOutput, WorkflowError> {
            Ok(TestOutput {
                result: input.value * 2,
            })
        }
    }

    fn replay(workflow: Arc<dyn AnyWorkflow>, input: Value) -> TurnOutcome {
        let started = HistoryEntry {
            sequence: 0,
            event: WorkflowEvent::RunStarted {
                workflow_type: "test_workflow".into(),
                input: input.clone(),
            },
            recorded_at: Utc::now(),
        };
        let history = RunHistory::from_entries(&[started]).expect("valid history");
        run_turn(Uuid::now_v7(), Arc::new(history), |ctx| {
            workflow.run(ctx, input)
        })
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);

        assert!(registry.contains("test_workflow"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let workflow = registry.get("test_workflow").expect("should be registered");
        assert_eq!(workflow.workflow_type(), "test_workflow");
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = WorkflowRegistry::new();
        let result = registry.get("unknown");

        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn test_workflow_execution_through_json() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);
        let workflow = registry.get("test_workflow").unwrap();

        let outcome = replay(workflow, serde_json::json!({ "value": 21 }));
        assert_eq!(
            outcome,
            TurnOutcome::Completed(serde_json::json!({ "result": 42 }))
        );
    }

    #[test]
    fn test_invalid_input_fails_the_run() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);
        let workflow = registry.get("test_workflow").unwrap();

        // Missing required field
        match replay(workflow, serde_json::json!({})) {
            TurnOutcome::Failed(error) => assert_eq!(error.code.as_deref(), Some(codes::INVALID_INPUT)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("test_workflow"));
    }

    #[test]
    fn test_workflow_types_iterator() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);

        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["test_workflow"]);
    }
}
