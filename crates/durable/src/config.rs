//! Engine configuration

use std::time::Duration;

use uuid::Uuid;

use crate::reliability::RetryPolicy;

/// Configuration for an [`Engine`](crate::Engine)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier recorded in `StepStarted` events
    pub worker_id: String,

    /// Maximum work items handled concurrently
    pub max_concurrency: usize,

    /// Upper bound on how long the timer loop sleeps between scans
    pub timer_poll_interval: Duration,

    /// Maximum due timers handed to the dispatcher per scan
    pub timer_batch_size: usize,

    /// Due timers not acknowledged within this window are delivered again
    pub timer_redelivery_timeout: Duration,

    /// Delay before a work item that hit a store error is retried
    pub store_retry_delay: Duration,

    /// Runs whose history grows past this are failed
    pub max_events_per_run: usize,

    /// How long shutdown waits for in-flight work
    pub shutdown_timeout: Duration,

    /// Policy for step calls that specify none
    pub default_retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 16,
            timer_poll_interval: Duration::from_millis(250),
            timer_batch_size: 100,
            timer_redelivery_timeout: Duration::from_secs(30),
            store_retry_delay: Duration::from_millis(500),
            max_events_per_run: 10_000,
            shutdown_timeout: Duration::from_secs(30),
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let millis = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let count = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        Self {
            worker_id: std::env::var("FLOWLINE_WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrency: count("FLOWLINE_MAX_CONCURRENCY", defaults.max_concurrency),
            timer_poll_interval: millis("FLOWLINE_TIMER_POLL_MS", defaults.timer_poll_interval),
            timer_batch_size: count("FLOWLINE_TIMER_BATCH_SIZE", defaults.timer_batch_size),
            timer_redelivery_timeout: millis(
                "FLOWLINE_TIMER_REDELIVERY_MS",
                defaults.timer_redelivery_timeout,
            ),
            store_retry_delay: millis("FLOWLINE_STORE_RETRY_MS", defaults.store_retry_delay),
            max_events_per_run: count("FLOWLINE_MAX_EVENTS_PER_RUN", defaults.max_events_per_run),
            shutdown_timeout: millis("FLOWLINE_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            default_retry_policy: defaults.default_retry_policy,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_timer_poll_interval(mut self, interval: Duration) -> Self {
        self.timer_poll_interval = interval;
        self
    }

    pub fn with_timer_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.timer_redelivery_timeout = timeout;
        self
    }

    pub fn with_store_retry_delay(mut self, delay: Duration) -> Self {
        self.store_retry_delay = delay;
        self
    }

    pub fn with_max_events_per_run(mut self, max_events: usize) -> Self {
        self.max_events_per_run = max_events;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }
}
