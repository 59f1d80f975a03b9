// Server configuration loaded from the environment

use std::time::Duration;

use anyhow::{Context, Result};
use flowline_durable::workflow::parse_span;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_SIGNUP_SLEEP: &str = "5s";
const DEFAULT_WELCOME_FAILURE_RATE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Pause between the welcome and onboarding emails, copied into each new
    /// run's input; runs already started keep the value they began with
    pub signup_sleep: Duration,
    /// Probability in [0, 1] that a welcome email attempt fails transiently
    pub welcome_failure_rate: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            signup_sleep: Duration::from_secs(5),
            welcome_failure_rate: DEFAULT_WELCOME_FAILURE_RATE,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let span =
            std::env::var("SIGNUP_SLEEP").unwrap_or_else(|_| DEFAULT_SIGNUP_SLEEP.to_string());
        let signup_sleep =
            parse_span(&span).with_context(|| format!("invalid SIGNUP_SLEEP: {span}"))?;

        let welcome_failure_rate = match std::env::var("WELCOME_FAILURE_RATE") {
            Ok(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("invalid WELCOME_FAILURE_RATE: {raw}"))?,
            Err(_) => DEFAULT_WELCOME_FAILURE_RATE,
        };

        Ok(Self {
            bind_addr,
            database_url,
            signup_sleep,
            welcome_failure_rate: clamp_rate(welcome_failure_rate),
        })
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
