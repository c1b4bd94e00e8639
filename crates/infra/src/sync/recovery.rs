//! Shared recovery context for the sync path.
//!
//! The breaker, budget, backoff strategy, stats, and dead-letter store are
//! process-wide singletons. Rather than module-level globals they travel
//! as one record threaded through the sync manager and observers.

use std::sync::Arc;
use std::time::Duration;

use inkstone_common::resilience::{
    BackoffConfig, BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, RetryBudget,
};
use inkstone_core::{DeadLetterStore, RecoveryStats};
use inkstone_domain::constants::MAX_SYNC_ATTEMPTS;
use inkstone_domain::{EngineError, Result};

/// Tunables for the recovery primitives.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u64,
    /// Half-open successes needed to close the breaker.
    pub success_threshold: u64,
    /// Wait before the open breaker lets a probe through.
    pub open_timeout: Duration,
    /// Retries permitted per budget window.
    pub budget_limit: u32,
    /// Budget window length.
    pub budget_window: Duration,
    /// Backoff tunables.
    pub backoff: BackoffConfig,
    /// Delivery attempts before an entry dead-letters.
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            budget_limit: 100,
            budget_window: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
            max_attempts: MAX_SYNC_ATTEMPTS,
        }
    }
}

/// The recovery singletons, wired once and shared.
pub struct RecoveryContext {
    pub breaker: CircuitBreaker,
    pub budget: RetryBudget,
    pub backoff: BackoffStrategy,
    pub stats: RecoveryStats,
    pub dlq: Arc<dyn DeadLetterStore>,
    pub max_attempts: u32,
}

impl RecoveryContext {
    /// Build a context from validated configuration.
    pub fn new(config: RecoveryConfig, dlq: Arc<dyn DeadLetterStore>) -> Result<Self> {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_timeout: config.open_timeout,
        })
        .map_err(|e| EngineError::Config(e.to_string()))?;

        let budget = RetryBudget::new(config.budget_limit, config.budget_window);
        let backoff = BackoffStrategy::new(config.backoff)
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(Self {
            breaker,
            budget,
            backoff,
            stats: RecoveryStats::new(),
            dlq,
            max_attempts: config.max_attempts,
        })
    }
}
