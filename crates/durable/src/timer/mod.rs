//! Durable timers for sleeps and retry backoff

mod service;

pub use service::TimerService;
