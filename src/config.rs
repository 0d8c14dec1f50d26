//! Configuration types.

use std::time::Duration;

use crate::retry::Backoff;

/// Per-worker polling and failure-handling knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls of an assignment's channel.
    pub poll_interval: Duration,
    /// Timeout applied to every gateway call.
    pub gateway_timeout: Duration,
    /// Consecutive transient fetch failures before a worker goes Failed.
    pub max_consecutive_failures: u32,
    /// Backoff policy for transient fetch failures and send retries.
    pub backoff: Backoff,
    /// Bounded attempts for sending one reply before dropping it.
    pub send_retry_attempts: u32,
    /// How long stop() waits for a worker to wind down before aborting it.
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            gateway_timeout: Duration::from_secs(30),
            max_consecutive_failures: 5,
            backoff: Backoff::default(),
            send_retry_attempts: 3,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Scheduler tick loop knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick cadence; short relative to schedule granularity.
    pub tick_interval: Duration,
    pub gateway_timeout: Duration,
    /// Send failures tolerated per entry per rolling day before the entry
    /// is disabled.
    pub daily_failure_cap: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            gateway_timeout: Duration::from_secs(30),
            daily_failure_cap: 10,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
}

impl OrchestratorConfig {
    /// Build from `BOTHERD_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_u64("BOTHERD_POLL_INTERVAL_SECS") {
            cfg.worker.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("BOTHERD_GATEWAY_TIMEOUT_SECS") {
            cfg.worker.gateway_timeout = Duration::from_secs(secs);
            cfg.scheduler.gateway_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("BOTHERD_MAX_FETCH_FAILURES") {
            cfg.worker.max_consecutive_failures = n as u32;
        }
        if let Some(secs) = env_u64("BOTHERD_SCHED_TICK_SECS") {
            cfg.scheduler.tick_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("BOTHERD_SCHED_DAILY_FAILURE_CAP") {
            cfg.scheduler.daily_failure_cap = n as u32;
        }
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
