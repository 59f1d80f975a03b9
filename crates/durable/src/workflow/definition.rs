//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowContext;
use crate::step::StepFailure;

/// Well-known values of [`WorkflowError::code`]
pub mod codes {
    /// Replay observed a call sequence inconsistent with recorded history
    pub const NONDETERMINISM: &str = "nondeterminism";

    /// A step failure propagated out of workflow logic
    pub const STEP_FAILED: &str = "step_failed";

    /// The run input could not be decoded into the workflow's input type
    pub const INVALID_INPUT: &str = "invalid_input";

    /// The workflow output could not be encoded
    pub const SERIALIZATION: &str = "serialization";

    /// A sleep span could not be parsed
    pub const INVALID_SPAN: &str = "invalid_span";

    /// The run's history outgrew the configured event limit
    pub const HISTORY_LIMIT: &str = "history_limit";
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Additional error details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    /// Error that halts a run whose replay diverged from its history
    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::NONDETERMINISM)
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_nondeterminism(&self) -> bool {
        self.code.as_deref() == Some(codes::NONDETERMINISM)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<StepFailure> for WorkflowError {
    fn from(failure: StepFailure) -> Self {
        let details = serde_json::json!({
            "step_name": failure.step_name,
            "call_id": failure.call_id,
            "error": failure.error,
        });
        Self::new(failure.error.message.clone())
            .with_code(codes::STEP_FAILED)
            .with_details(details)
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A workflow is deterministic logic composed of step calls and sleeps
///
/// The engine re-runs `run` from the top on every activation. Calls whose
/// outcome is already recorded in history resolve immediately; the first
/// unresolved call suspends the run and the future is dropped. Its position
/// in history is durable, its stack is not.
///
/// # Determinism
///
/// Given the same input and the same sequence of step/sleep outcomes, `run`
/// must issue the same calls in the same order. Random values, clock reads
/// and I/O belong inside steps. Awaiting anything other than
/// [`WorkflowContext`] futures is treated as nondeterminism.
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// struct UserSignup;
///
/// #[async_trait]
/// impl Workflow for UserSignup {
///     const TYPE: &'static str = "user_signup";
///     type Input = String;
///     type Output = SignupResult;
///
///     async fn run(&self, ctx: WorkflowContext, email: String) -> Result<SignupResult, WorkflowError> {
///         let user = ctx.step::<CreateUser>(email).await?;
///         ctx.step::<SendWelcomeEmail>(user.clone()).await?;
///         ctx.sleep("5s").await?;
///         ctx.step::<SendOnboardingEmail>(user.clone()).await?;
///         Ok(SignupResult { user_id: user.id, status: "onboarded".into() })
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + 'static;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Workflow entry point
    async fn run(
        &self,
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepError;

    #[test]
    fn test_workflow_error() {
        let err = WorkflowError::new("boom").with_code("E1");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.code.as_deref(), Some("E1"));
        assert!(!err.is_nondeterminism());
        assert!(WorkflowError::nondeterminism("diverged").is_nondeterminism());
    }

    #[test]
    fn test_from_step_failure() {
        let failure = StepFailure {
            step_name: "send_onboarding_email".into(),
            call_id: 3,
            error: StepError::fatal("Invalid Email"),
        };

        let err: WorkflowError = failure.into();
        assert_eq!(err.message, "Invalid Email");
        assert_eq!(err.code.as_deref(), Some(codes::STEP_FAILED));
        let details = err.details.expect("should carry details");
        assert_eq!(details["step_name"], "send_onboarding_email");
        assert_eq!(details["call_id"], 3);
        assert_eq!(details["error"]["kind"], "fatal");
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(WorkflowError::new("x")).unwrap();
        assert_eq!(json, serde_json::json!({"message": "x"}));
    }
}
