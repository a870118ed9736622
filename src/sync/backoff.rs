use crate::config::OfflineConfig;
use rand::Rng;
use std::time::Duration;

/// Fraction of the nominal delay added or removed at random
const JITTER: f64 = 0.25;

/// Exponential backoff for queued mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &OfflineConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the `failures`-th failed attempt: `base * 2^(failures-1)`
    /// with ±25% jitter, never above `max`
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(30);
        let nominal = self.base.as_millis() as f64 * 2f64.powi(exponent as i32);
        let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        let capped = (nominal * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OfflineConfig::default())
    }
}
