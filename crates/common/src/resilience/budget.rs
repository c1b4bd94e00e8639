//! Sliding-window retry budget to prevent retry storms.
//!
//! Independent of backoff: backoff spaces out retries of one operation,
//! the budget caps how many retries the whole process may issue within a
//! rolling window. First attempts are never charged against it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::time::{Clock, SystemClock};

/// Snapshot of budget usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStats {
    /// Retries recorded inside the current window.
    pub retries: u32,
    /// Maximum retries allowed per window.
    pub limit: u32,
    /// `retries / limit` as a percentage.
    pub percent_used: f64,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Milliseconds until the oldest recorded retry leaves the window.
    pub window_reset_in_ms: u64,
}

/// Sliding-window counter of retry events.
///
/// Clones share state so the sync manager and observers see one budget.
#[derive(Debug, Clone)]
pub struct RetryBudget<C: Clock = SystemClock> {
    limit: u32,
    window: Duration,
    /// Timestamps (millis since epoch) of recorded retries, oldest first.
    /// Pruned lazily on access.
    events: Arc<Mutex<VecDeque<u64>>>,
    clock: Arc<C>,
}

impl RetryBudget<SystemClock> {
    /// Create a new retry budget with the system clock.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_clock(limit, window, SystemClock)
    }
}

impl<C: Clock> RetryBudget<C> {
    /// Create a new retry budget with a custom clock (for testing).
    pub fn with_clock(limit: u32, window: Duration, clock: C) -> Self {
        Self {
            limit,
            window,
            events: Arc::new(Mutex::new(VecDeque::new())),
            clock: Arc::new(clock),
        }
    }

    /// True when another retry may be issued right now.
    pub fn can_retry(&self) -> bool {
        let now = self.clock.millis_since_epoch();
        match self.events.lock() {
            Ok(mut events) => {
                Self::prune(&mut events, now, self.window);
                (events.len() as u32) < self.limit
            }
            Err(_) => false,
        }
    }

    /// Record one retry event at the current clock time.
    pub fn record_retry(&self) {
        let now = self.clock.millis_since_epoch();
        if let Ok(mut events) = self.events.lock() {
            Self::prune(&mut events, now, self.window);
            events.push_back(now);
        }
    }

    /// Current usage snapshot.
    pub fn stats(&self) -> BudgetStats {
        let now = self.clock.millis_since_epoch();
        let window_ms = self.window.as_millis() as u64;

        let (retries, reset_in) = match self.events.lock() {
            Ok(mut events) => {
                Self::prune(&mut events, now, self.window);
                let reset_in = events
                    .front()
                    .map(|oldest| (oldest + window_ms).saturating_sub(now))
                    .unwrap_or(0);
                (events.len() as u32, reset_in)
            }
            Err(_) => (self.limit, window_ms),
        };

        let percent_used = if self.limit == 0 {
            100.0
        } else {
            f64::from(retries) / f64::from(self.limit) * 100.0
        };

        BudgetStats {
            retries,
            limit: self.limit,
            percent_used,
            window_ms,
            window_reset_in_ms: reset_in,
        }
    }

    /// Drop all recorded events.
    pub fn reset(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Maximum retries per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn prune(events: &mut VecDeque<u64>, now: u64, window: Duration) {
        let cutoff = now.saturating_sub(window.as_millis() as u64);
        while events.front().is_some_and(|&at| at <= cutoff) {
            events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the sliding-window retry budget.
    use crate::time::MockClock;

    use super::*;

    fn budget(limit: u32, window_ms: u64) -> (RetryBudget<MockClock>, MockClock) {
        let clock = MockClock::new();
        // Start away from zero so saturating arithmetic has headroom.
        clock.advance_millis(100_000);
        let budget = RetryBudget::with_clock(limit, Duration::from_millis(window_ms), clock.clone());
        (budget, clock)
    }

    /// Validates a fresh budget allowing retries.
    #[test]
    fn test_fresh_budget_allows_retry() {
        let (budget, _clock) = budget(10, 1_000);
        assert!(budget.can_retry());
        assert_eq!(budget.stats().retries, 0);
    }

    /// Tests the documented boundary: ten recorded retries with limit 10
    /// exhaust the budget; 1100ms later it is usable again.
    #[test]
    fn test_exhaustion_and_window_reset() {
        let (budget, clock) = budget(10, 1_000);

        for _ in 0..10 {
            assert!(budget.can_retry());
            budget.record_retry();
        }
        assert!(!budget.can_retry(), "ten retries exhaust the window");

        clock.advance_millis(1_100);
        assert!(budget.can_retry(), "events should have aged out");
        assert_eq!(budget.stats().retries, 0);
    }

    /// Tests that no window ever admits more than `limit` retries.
    #[test]
    fn test_limit_holds_across_partial_expiry() {
        let (budget, clock) = budget(3, 1_000);

        budget.record_retry();
        clock.advance_millis(400);
        budget.record_retry();
        clock.advance_millis(400);
        budget.record_retry();

        assert!(!budget.can_retry(), "three events in the last second");

        // The first event (800ms old) expires 200ms later.
        clock.advance_millis(250);
        assert!(budget.can_retry());
        assert_eq!(budget.stats().retries, 2);
    }

    /// Validates `stats` content and reset countdown.
    #[test]
    fn test_stats_snapshot() {
        let (budget, clock) = budget(4, 1_000);

        budget.record_retry();
        clock.advance_millis(300);
        budget.record_retry();

        let stats = budget.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.limit, 4);
        assert!((stats.percent_used - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.window_ms, 1_000);
        assert_eq!(stats.window_reset_in_ms, 700);
    }

    /// Validates `reset` clearing usage immediately.
    #[test]
    fn test_reset_clears_events() {
        let (budget, _clock) = budget(2, 1_000);

        budget.record_retry();
        budget.record_retry();
        assert!(!budget.can_retry());

        budget.reset();
        assert!(budget.can_retry());
        assert_eq!(budget.stats().retries, 0);
    }

    /// Validates a zero-limit budget never permitting retries.
    #[test]
    fn test_zero_limit_budget() {
        let (budget, _clock) = budget(0, 1_000);
        assert!(!budget.can_retry());
        assert!((budget.stats().percent_used - 100.0).abs() < f64::EPSILON);
    }

    /// Validates clones sharing the same window.
    #[test]
    fn test_clone_shares_state() {
        let (budget, _clock) = budget(1, 1_000);
        let other = budget.clone();

        budget.record_retry();
        assert!(!other.can_retry());
    }
}
