//! Step registry and executor
//!
//! Steps are registered by name and invoked with JSON input. The executor
//! is stateless across calls: it runs one physical attempt and returns a
//! classified [`StepOutcome`]. Recording the outcome is the orchestrator's job.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Step, StepContext, StepError, StepErrorKind};
use crate::reliability::{FailureClass, RetryPolicy};

/// Classified result of one physical step attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Normal return
    Success(Value),

    /// Error not marked fatal
    TransientFailure(StepError),

    /// Error marked fatal, or a step that cannot run at all
    PermanentFailure(StepError),
}

impl StepOutcome {
    /// Classify a raw step result
    pub fn classify(result: Result<Value, StepError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => match err.kind {
                StepErrorKind::Transient => Self::TransientFailure(err),
                StepErrorKind::Fatal => Self::PermanentFailure(err),
            },
        }
    }

    /// Failure classification for the retry evaluator, `None` on success
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::Success(_) => None,
            Self::TransientFailure(_) => Some(FailureClass::Transient),
            Self::PermanentFailure(_) => Some(FailureClass::Permanent),
        }
    }
}

/// Type-erased step interface
trait AnyStep: Send + Sync {
    fn retry_policy(&self) -> Option<RetryPolicy>;

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, StepError>>;
}

struct StepWrapper<S: Step> {
    inner: S,
}

impl<S: Step> AnyStep for StepWrapper<S> {
    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.inner.retry_policy()
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let typed: S::Input = serde_json::from_value(input).map_err(|e| {
                StepError::fatal(format!("invalid input for step '{}': {e}", S::NAME))
                    .with_type("INVALID_INPUT")
            })?;

            let output = self.inner.execute(ctx, typed).await?;

            serde_json::to_value(output).map_err(|e| {
                StepError::fatal(format!("cannot serialize output of step '{}': {e}", S::NAME))
                    .with_type("SERIALIZATION")
            })
        })
    }
}

/// Registry of steps plus the attempt runner
#[derive(Default)]
pub struct StepExecutor {
    steps: HashMap<String, Arc<dyn AnyStep>>,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its `NAME`, replacing any previous registration
    pub fn register<S: Step>(&mut self, step: S) {
        self.steps
            .insert(S::NAME.to_string(), Arc::new(StepWrapper { inner: step }));
    }

    pub fn contains(&self, step_name: &str) -> bool {
        self.steps.contains_key(step_name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    /// Retry policy declared by the step itself
    pub fn retry_policy(&self, step_name: &str) -> Option<RetryPolicy> {
        self.steps.get(step_name).and_then(|s| s.retry_policy())
    }

    /// Run one physical attempt of `ctx.step_name` and classify the outcome
    ///
    /// A panic inside step code is reported as a transient failure.
    pub async fn execute(&self, ctx: &StepContext, input: Value) -> StepOutcome {
        let Some(step) = self.steps.get(&ctx.step_name).cloned() else {
            warn!(step = %ctx.step_name, run_id = %ctx.run_id, "no step registered under this name");
            return StepOutcome::PermanentFailure(
                StepError::fatal(format!("no step registered as '{}'", ctx.step_name))
                    .with_type("UNKNOWN_STEP"),
            );
        };

        debug!(
            run_id = %ctx.run_id,
            step = %ctx.step_name,
            call_id = ctx.call_id,
            attempt = ctx.attempt,
            "executing step attempt"
        );

        let result = match AssertUnwindSafe(step.execute(ctx, input))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(step = %ctx.step_name, run_id = %ctx.run_id, %reason, "step panicked");
                Err(StepError::transient(format!("step panicked: {reason}")).with_type("PANIC"))
            }
        };

        StepOutcome::classify(result)
    }
}

impl fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutor")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait]
    impl Step for Add {
        const NAME: &'static str = "add";
        type Input = AddInput;
        type Output = i64;

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(RetryPolicy::fixed(Duration::from_millis(10), 2))
        }

        async fn execute(&self, _ctx: &StepContext, input: AddInput) -> Result<i64, StepError> {
            if input.a < 0 {
                return Err(StepError::fatal("negative input"));
            }
            if input.b < 0 {
                return Err(StepError::transient("try again"));
            }
            Ok(input.a + input.b)
        }
    }

    struct Explode;

    #[async_trait]
    impl Step for Explode {
        const NAME: &'static str = "explode";
        type Input = ();
        type Output = ();

        async fn execute(&self, _ctx: &StepContext, _input: ()) -> Result<(), StepError> {
            panic!("boom");
        }
    }

    fn ctx(name: &str) -> StepContext {
        StepContext::new(Uuid::now_v7(), 0, name, 1, 3)
    }

    fn executor() -> StepExecutor {
        let mut executor = StepExecutor::new();
        executor.register(Add);
        executor.register(Explode);
        executor
    }

    #[tokio::test]
    async fn test_success() {
        let outcome = executor()
            .execute(&ctx("add"), serde_json::json!({"a": 2, "b": 3}))
            .await;
        assert_eq!(outcome, StepOutcome::Success(serde_json::json!(5)));
        assert_eq!(outcome.failure_class(), None);
    }

    #[tokio::test]
    async fn test_transient_and_fatal_classification() {
        let executor = executor();

        let outcome = executor
            .execute(&ctx("add"), serde_json::json!({"a": 1, "b": -1}))
            .await;
        assert!(matches!(outcome, StepOutcome::TransientFailure(_)));
        assert_eq!(outcome.failure_class(), Some(FailureClass::Transient));

        let outcome = executor
            .execute(&ctx("add"), serde_json::json!({"a": -1, "b": 1}))
            .await;
        assert!(matches!(outcome, StepOutcome::PermanentFailure(_)));
        assert_eq!(outcome.failure_class(), Some(FailureClass::Permanent));
    }

    #[tokio::test]
    async fn test_unknown_step_is_permanent() {
        let outcome = executor().execute(&ctx("missing"), Value::Null).await;
        match outcome {
            StepOutcome::PermanentFailure(err) => {
                assert_eq!(err.error_type.as_deref(), Some("UNKNOWN_STEP"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_input_is_permanent() {
        let outcome = executor()
            .execute(&ctx("add"), serde_json::json!({"a": "two"}))
            .await;
        match outcome {
            StepOutcome::PermanentFailure(err) => {
                assert_eq!(err.error_type.as_deref(), Some("INVALID_INPUT"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_transient() {
        let outcome = executor().execute(&ctx("explode"), Value::Null).await;
        match outcome {
            StepOutcome::TransientFailure(err) => assert!(err.message.contains("boom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let executor = executor();
        assert!(executor.contains("add"));
        assert!(!executor.contains("missing"));
        assert_eq!(executor.len(), 2);
        assert_eq!(executor.retry_policy("add").map(|p| p.max_attempts), Some(2));
        assert!(executor.retry_policy("explode").is_none());
        assert!(format!("{executor:?}").contains("add"));
    }
}
