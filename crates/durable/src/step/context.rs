//! Step execution context

use uuid::Uuid;

/// Context provided to steps during execution
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Unique ID of this physical attempt
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the policy in force
    pub max_attempts: u32,

    /// Run that owns this step call
    pub run_id: Uuid,

    /// Position of the call within the run
    pub call_id: u32,

    /// Registered step name
    pub step_name: String,
}

impl StepContext {
    pub fn new(
        run_id: Uuid,
        call_id: u32,
        step_name: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            run_id,
            call_id,
            step_name: step_name.into(),
        }
    }

    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Key that stays the same across every attempt of this call
    ///
    /// Forward it to external systems that support idempotent requests.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.run_id, self.call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_attempt() {
        let run_id = Uuid::now_v7();
        let ctx = StepContext::new(run_id, 0, "charge", 2, 3);
        assert!(!ctx.is_last_attempt());

        let ctx = StepContext::new(run_id, 0, "charge", 3, 3);
        assert!(ctx.is_last_attempt());
    }

    #[test]
    fn test_idempotency_key_is_stable_across_attempts() {
        let run_id = Uuid::now_v7();
        let first = StepContext::new(run_id, 4, "charge", 1, 3);
        let second = StepContext::new(run_id, 4, "charge", 2, 3);

        assert_eq!(first.idempotency_key(), second.idempotency_key());
        assert_ne!(first.attempt_id, second.attempt_id);
        assert_eq!(first.idempotency_key(), format!("{run_id}:4"));
    }
}
