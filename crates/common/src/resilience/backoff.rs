//! Exponential backoff with full jitter for retry scheduling.
//!
//! The delay for attempt `n` grows as `base * 2^(n-1)`, capped at
//! `max_delay`, then randomized by a uniform jitter factor so that many
//! clients recovering from the same outage do not retry in lockstep. A
//! server-provided `Retry-After` hint acts as a floor on the result.

use std::time::Duration;

use rand::Rng;

use crate::error::{CommonError, CommonResult};

/// Maximum exponent for the exponential calculation to prevent overflow.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Configuration for [`BackoffStrategy`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay used when the classifier suggests none.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Jitter factor `J`: the delay is scaled by a uniform factor in
    /// `[1-J, 1+J]`.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            jitter_factor: 0.3,
        }
    }
}

/// Backoff delay calculator.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    config: BackoffConfig,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self { config: BackoffConfig::default() }
    }
}

impl BackoffStrategy {
    /// Create a strategy with validated configuration.
    pub fn new(config: BackoffConfig) -> CommonResult<Self> {
        if !(0.0..1.0).contains(&config.jitter_factor) {
            return Err(CommonError::config(format!(
                "jitter_factor must be in [0, 1), got {}",
                config.jitter_factor
            )));
        }
        if config.base_delay > config.max_delay {
            return Err(CommonError::config(format!(
                "base_delay ({:?}) cannot be greater than max_delay ({:?})",
                config.base_delay, config.max_delay
            )));
        }
        Ok(Self { config })
    }

    /// Compute the delay before retry `attempt` (1-based).
    ///
    /// `suggested_base` overrides the configured base delay (the classifier
    /// supplies a per-category suggestion); `retry_after` floors the result
    /// so a server's `Retry-After` hint is always honored.
    pub fn delay(
        &self,
        attempt: u32,
        suggested_base: Option<Duration>,
        retry_after: Option<Duration>,
    ) -> Duration {
        let base = suggested_base.unwrap_or(self.config.base_delay);
        let raw = self.exponential_delay(base, attempt);
        let jittered = self.apply_jitter(raw);
        match retry_after {
            Some(floor) => jittered.max(floor),
            None => jittered,
        }
    }

    fn exponential_delay(&self, base: Duration, attempt: u32) -> Duration {
        let base_millis = base.as_millis() as u64;
        let max_millis = self.config.max_delay.as_millis() as u64;

        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let multiplier = 2_u64.saturating_pow(exponent);
        let delay_millis = base_millis.saturating_mul(multiplier).min(max_millis);

        Duration::from_millis(delay_millis)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor == 0.0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(-self.config.jitter_factor..=self.config.jitter_factor);
        let jittered = delay.as_millis() as f64 * (1.0 + factor);

        let ceiling = self.config.max_delay.as_millis() as f64 * (1.0 + self.config.jitter_factor);
        Duration::from_millis(jittered.clamp(0.0, ceiling) as u64)
    }
}
