//! Scheduler tuning knobs.

use std::time::Duration;

use storyreel_core::backoff::BackoffConfig;

/// Tunable parameters for the batch scheduler.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// How often the scheduler looks for admissible work.
    pub tick_interval: Duration,
    /// Global cap on concurrently running jobs across all types.
    pub max_concurrent_jobs: usize,
    /// Ceiling on the summed memory estimate of running jobs, MB.
    pub max_memory_mb: f64,
    /// Ceiling on the summed cost-rate of running jobs, currency units/hour.
    pub max_cost_per_hour: f64,
    /// Backoff applied to retry re-enqueues.
    pub backoff: BackoffConfig,
    /// Whether the second admission pass may fill leftover slots with
    /// lower-priority jobs when a higher-priority job does not fit the
    /// resource envelope. Avoids starving the queue on resource-heavy
    /// jobs, at the price of occasionally running cheap work first.
    pub enable_opportunistic_fill: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            max_concurrent_jobs: 8,
            max_memory_mb: 4096.0,
            max_cost_per_hour: 50.0,
            backoff: BackoffConfig::default(),
            enable_opportunistic_fill: true,
        }
    }
}
