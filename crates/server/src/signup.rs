// User signup workflow and its steps
//
// create_user -> send_welcome_email -> sleep -> send_onboarding_email

use std::time::Duration;

use flowline_durable::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ServerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

pub struct CreateUser;

#[async_trait]
impl Step for CreateUser {
    const NAME: &'static str = "create_user";
    type Input = String;
    type Output = User;

    async fn execute(&self, ctx: &StepContext, email: String) -> Result<User, StepError> {
        let user = User {
            id: Uuid::now_v7(),
            email,
        };
        tracing::info!(
            run_id = %ctx.run_id,
            user_id = %user.id,
            email = %user.email,
            "created user"
        );
        Ok(user)
    }
}

/// Mail relay stand-in that fails transiently at a configured rate
pub struct SendWelcomeEmail {
    failure_rate: f64,
}

impl SendWelcomeEmail {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Step for SendWelcomeEmail {
    const NAME: &'static str = "send_welcome_email";
    type Input = User;
    type Output = ();

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(
            RetryPolicy::exponential()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_attempts(5),
        )
    }

    async fn execute(&self, ctx: &StepContext, user: User) -> Result<(), StepError> {
        if rand::thread_rng().gen_bool(self.failure_rate) {
            tracing::warn!(
                user_id = %user.id,
                attempt = ctx.attempt,
                "welcome email relay failed"
            );
            return Err(StepError::transient("Failed to send welcome email").with_type("SMTP"));
        }
        tracing::info!(user_id = %user.id, email = %user.email, "sent welcome email");
        Ok(())
    }
}

pub struct SendOnboardingEmail;

#[async_trait]
impl Step for SendOnboardingEmail {
    const NAME: &'static str = "send_onboarding_email";
    type Input = User;
    type Output = ();

    async fn execute(&self, _ctx: &StepContext, user: User) -> Result<(), StepError> {
        if !user.email.contains('@') {
            return Err(StepError::fatal("Invalid Email").with_type("INVALID_EMAIL"));
        }
        tracing::info!(user_id = %user.id, email = %user.email, "sent onboarding email");
        Ok(())
    }
}

/// Input of a signup run
///
/// The pause is fixed when the run starts, so a run suspended on it replays
/// the same sleep even if the configured default changes across a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignupInput {
    pub email: String,
    pub sleep_ms: u64,
}

impl SignupInput {
    pub fn new(email: impl Into<String>, sleep: Duration) -> Self {
        Self {
            email: email.into(),
            sleep_ms: u64::try_from(sleep.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

pub struct UserSignup;

#[async_trait]
impl Workflow for UserSignup {
    const TYPE: &'static str = "user_signup";
    type Input = SignupInput;
    type Output = Value;

    async fn run(&self, ctx: WorkflowContext, input: SignupInput) -> Result<Value, WorkflowError> {
        let sleep = input.sleep();
        let user = ctx.step::<CreateUser>(input.email).await?;
        ctx.step::<SendWelcomeEmail>(user.clone()).await?;
        if !ctx.is_replaying() {
            tracing::debug!(user_id = %user.id, ?sleep, "waiting before onboarding");
        }
        ctx.sleep_for(sleep).await;
        ctx.step::<SendOnboardingEmail>(user.clone()).await?;
        Ok(json!({ "user_id": user.id, "status": "onboarded" }))
    }
}

/// Register the signup workflow and its steps
pub fn register(builder: EngineBuilder, config: &ServerConfig) -> EngineBuilder {
    builder
        .workflow(UserSignup)
        .step(CreateUser)
        .step(SendWelcomeEmail::new(config.welcome_failure_rate))
        .step(SendOnboardingEmail)
}
