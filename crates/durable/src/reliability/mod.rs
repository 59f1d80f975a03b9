//! Reliability primitives

mod retry;

pub use retry::{FailureClass, RetryDecision, RetryPolicy};
