//! Three-state circuit breaker gating outbound sync calls.
//!
//! The breaker prevents a failing remote from being hammered by the drain
//! loop: after `failure_threshold` consecutive failures it opens and rejects
//! calls immediately, after `open_timeout` it lets probes through in
//! half-open state, and `success_threshold` consecutive probe successes
//! close it again. Any half-open failure reopens it and restarts the timer.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::time::{Clock, SystemClock};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors that can occur when executing through resilience wrappers.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls without invoking them.
    #[error("Circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// The underlying operation failed.
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

/// Result type for breaker-wrapped operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Configuration result type.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests.
    Closed,
    /// Circuit is open, rejecting requests.
    Open,
    /// Circuit is half-open, allowing probes to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u64,
    /// Consecutive half-open successes needed to close the circuit.
    pub success_threshold: u64,
    /// Time to wait before transitioning from open to half-open.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "success_threshold must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: Option<CircuitBreakerConfig>,
}

impl CircuitBreakerConfigBuilder {
    fn config_mut(&mut self) -> &mut CircuitBreakerConfig {
        self.config.get_or_insert_with(CircuitBreakerConfig::default)
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config_mut().failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config_mut().success_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config_mut().open_timeout = timeout;
        self
    }

    pub fn build(mut self) -> ConfigResult<CircuitBreakerConfig> {
        let config = self.config_mut().clone();
        config.validate()?;
        Ok(config)
    }
}

/// Circuit breaker metrics for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub half_open_successes: u64,
    pub total_calls: u64,
    pub trips: u64,
}

/// Generic circuit breaker with an injectable clock.
///
/// Clones share state, so one breaker can gate the whole sync path while
/// observers read its metrics.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU64>,
    half_open_successes: Arc<AtomicU64>,
    total_calls: Arc<AtomicU64>,
    trips: Arc<AtomicU64>,
    opened_at: Arc<RwLock<Option<Instant>>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            consecutive_failures: Arc::clone(&self.consecutive_failures),
            half_open_successes: Arc::clone(&self.half_open_successes),
            total_calls: Arc::clone(&self.total_calls),
            trips: Arc::clone(&self.trips),
            opened_at: Arc::clone(&self.opened_at),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing).
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU64::new(0)),
            half_open_successes: Arc::new(AtomicU64::new(0)),
            total_calls: Arc::new(AtomicU64::new(0)),
            trips: Arc::new(AtomicU64::new(0)),
            opened_at: Arc::new(RwLock::new(None)),
            clock: Arc::new(clock),
        })
    }

    /// Check whether the breaker allows execution.
    ///
    /// Returns `false` while open and the timeout has not elapsed. When the
    /// timeout has elapsed, transitions to half-open and returns `true`.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = match self.opened_at.read() {
                    Ok(guard) => *guard,
                    Err(poisoned) => {
                        warn!("circuit breaker opened_at lock poisoned");
                        *poisoned.into_inner()
                    }
                };

                if let Some(opened) = opened_at {
                    if self.clock.now().duration_since(opened) >= self.config.open_timeout {
                        self.transition_to(CircuitState::HalfOpen);
                        self.half_open_successes.store(0, Ordering::Release);
                        debug!("circuit breaker probing after open timeout");
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejects immediately with [`ResilienceError::CircuitOpen`] when the
    /// breaker is open, without invoking the operation.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.can_execute() {
            debug!(state = %self.state(), "circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen);
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match operation().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(error) => {
                self.record_failure();
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                    self.consecutive_failures.store(0, Ordering::Release);
                    info!(successes, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {
                // A success while open means an in-flight call finished after
                // the trip; it does not reopen the gate early.
                debug!("success observed while circuit open");
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.trip();
                    warn!(failures, "circuit breaker opened after consecutive failures");
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during probing reopens immediately and restarts
                // the open timer.
                self.trip();
                warn!("circuit breaker reopened by half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self) {
        self.transition_to(CircuitState::Open);
        self.half_open_successes.store(0, Ordering::Release);
        self.trips.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut opened) = self.opened_at.write() {
            *opened = Some(self.clock.now());
        }
    }

    fn transition_to(&self, next: CircuitState) {
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => {
                warn!("circuit breaker state lock poisoned during transition");
                *poisoned.into_inner() = next;
            }
        }
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn!("circuit breaker state lock poisoned during read");
                *poisoned.into_inner()
            }
        }
    }

    /// Get a metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            half_open_successes: self.half_open_successes.load(Ordering::Acquire),
            total_calls: self.total_calls.load(Ordering::Acquire),
            trips: self.trips.load(Ordering::Acquire),
        }
    }

    /// Force the breaker back to closed and clear all counters.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
        if let Ok(mut opened) = self.opened_at.write() {
            *opened = None;
        }
        self.transition_to(CircuitState::Closed);
        info!("circuit breaker manually reset to closed state");
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        // Default config is validated above; constructing it cannot fail.
        match Self::new(CircuitBreakerConfig::default()) {
            Ok(breaker) => breaker,
            Err(_) => unreachable!("default circuit breaker config is valid"),
        }
    }
}
