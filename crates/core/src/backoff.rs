//! Exponential retry backoff math.
//!
//! Shared by the batch scheduler (re-enqueue delays) and the pipeline's
//! provider retry wrapper, so both sides compute the same delay for the
//! same attempt number.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows per additional retry.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Delay to wait before retry number `retry_count` (1-based).
///
/// `base_delay * multiplier^(retry_count - 1)`, clamped to
/// [`BackoffConfig::max_delay`]. `retry_count == 0` yields zero delay.
pub fn retry_delay(retry_count: u32, config: &BackoffConfig) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let factor = config.multiplier.powi(retry_count as i32 - 1);
    let ms = (config.base_delay.as_millis() as f64 * factor) as u64;
    Duration::from_millis(ms).min(config.max_delay)
}
