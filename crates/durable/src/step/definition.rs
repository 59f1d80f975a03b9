//! Step trait and step error types

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::StepContext;
use crate::reliability::RetryPolicy;

/// Classification attached to every error raised from step code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Retried according to the step's retry policy
    Transient,

    /// Never retried; the step fails on the attempt that raised it
    Fatal,
}

/// Error type for step failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Retry classification
    pub kind: StepErrorKind,

    /// Error type/code for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a transient error (retried per policy)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Transient,
            error_type: None,
            details: None,
        }
    }

    /// Create a fatal error (never retried)
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Fatal,
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == StepErrorKind::Fatal
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Terminal failure of a step call, as observed by workflow logic
///
/// Produced once retries are exhausted or a fatal error was raised. It is an
/// ordinary error value: workflow code may match on it, compensate, or
/// propagate it with `?`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    /// Registered name of the step
    pub step_name: String,

    /// Position of the call within the run
    pub call_id: u32,

    /// The error raised by the final attempt
    pub error: StepError,
}

impl StepFailure {
    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' failed: {}", self.step_name, self.error)
    }
}

impl std::error::Error for StepFailure {}

/// A step is a unit of side-effecting work invoked from workflow logic
///
/// Each physical attempt calls `execute` once. The engine records the outcome
/// and never invokes the step again for a call whose outcome is recorded.
/// Steps must tolerate duplicate execution after a crash: use
/// [`StepContext::idempotency_key`] when talking to external systems.
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// struct SendEmail;
///
/// #[async_trait]
/// impl Step for SendEmail {
///     const NAME: &'static str = "send_email";
///     type Input = EmailRequest;
///     type Output = EmailReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, StepError> {
///         if !input.to.contains('@') {
///             return Err(StepError::fatal("Invalid Email"));
///         }
///         mailer.send(&input, ctx.idempotency_key()).await.map_err(StepError::from)
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Unique name for this step
    ///
    /// This is recorded in history and used to look up the step on replay.
    const NAME: &'static str;

    /// Input type for the step
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the step
    type Output: Serialize + DeserializeOwned + Send;

    /// Retry policy for every call of this step, unless the call overrides it
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Execute the step
    ///
    /// # Errors
    ///
    /// Return `StepError::transient()` for failures that should be retried.
    /// Return `StepError::fatal()` for failures that must not be retried.
    async fn execute(&self, ctx: &StepContext, input: Self::Input)
        -> Result<Self::Output, StepError>;
}
