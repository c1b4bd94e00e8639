//! Process-wide recovery counters.
//!
//! Observational only: the sync manager and hydration service write into
//! these counters, dashboards read snapshots. Safe to read concurrently
//! with updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::sync::classify::ErrorCategory;

const CATEGORY_COUNT: usize = ErrorCategory::ALL.len();

/// Shared recovery counters. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    retried_operations: AtomicU64,
    errors_by_category: [AtomicU64; CATEGORY_COUNT],
    retry_delay_sum_ms: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    retry_budget_exhaustion: AtomicU64,
    dead_letter_count: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub retried_operations: u64,
    /// Histogram across all classifier categories; every category is
    /// present even at zero.
    pub errors_by_category: BTreeMap<String, u64>,
    /// Mean retries per completed operation.
    pub average_retry_count: f64,
    /// Mean scheduled backoff delay per retry, in milliseconds.
    pub average_retry_delay_ms: f64,
    pub circuit_breaker_trips: u64,
    pub retry_budget_exhaustion: u64,
    pub dead_letter_count: u64,
}

impl RecoveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one operation entering the push path.
    pub fn record_operation(&self) {
        self.inner.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful delivery.
    pub fn record_success(&self) {
        self.inner.successful_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed attempt under its classifier category.
    pub fn record_failure(&self, category: ErrorCategory) {
        self.inner.failed_operations.fetch_add(1, Ordering::Relaxed);
        let index = ErrorCategory::ALL.iter().position(|c| *c == category).unwrap_or(0);
        self.inner.errors_by_category[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one scheduled retry and its backoff delay.
    pub fn record_retry(&self, delay: Duration) {
        self.inner.retried_operations.fetch_add(1, Ordering::Relaxed);
        self.inner.retry_delay_sum_ms.fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Count a circuit breaker transition to open.
    pub fn record_circuit_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a retry deferred by budget exhaustion.
    pub fn record_budget_exhaustion(&self) {
        self.inner.retry_budget_exhaustion.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an operation moved to the dead-letter queue.
    pub fn record_dead_letter(&self) {
        self.inner.dead_letter_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    pub fn snapshot(&self) -> RecoveryStatsSnapshot {
        let total = self.inner.total_operations.load(Ordering::Acquire);
        let retried = self.inner.retried_operations.load(Ordering::Acquire);
        let delay_sum = self.inner.retry_delay_sum_ms.load(Ordering::Acquire);

        let mut errors_by_category = BTreeMap::new();
        for (index, category) in ErrorCategory::ALL.iter().enumerate() {
            errors_by_category.insert(
                category.as_str().to_string(),
                self.inner.errors_by_category[index].load(Ordering::Acquire),
            );
        }

        RecoveryStatsSnapshot {
            total_operations: total,
            successful_operations: self.inner.successful_operations.load(Ordering::Acquire),
            failed_operations: self.inner.failed_operations.load(Ordering::Acquire),
            retried_operations: retried,
            errors_by_category,
            average_retry_count: if total == 0 { 0.0 } else { retried as f64 / total as f64 },
            average_retry_delay_ms: if retried == 0 {
                0.0
            } else {
                delay_sum as f64 / retried as f64
            },
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Acquire),
            retry_budget_exhaustion: self.inner.retry_budget_exhaustion.load(Ordering::Acquire),
            dead_letter_count: self.inner.dead_letter_count.load(Ordering::Acquire),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.inner.total_operations.store(0, Ordering::Release);
        self.inner.successful_operations.store(0, Ordering::Release);
        self.inner.failed_operations.store(0, Ordering::Release);
        self.inner.retried_operations.store(0, Ordering::Release);
        for counter in &self.inner.errors_by_category {
            counter.store(0, Ordering::Release);
        }
        self.inner.retry_delay_sum_ms.store(0, Ordering::Release);
        self.inner.circuit_breaker_trips.store(0, Ordering::Release);
        self.inner.retry_budget_exhaustion.store(0, Ordering::Release);
        self.inner.dead_letter_count.store(0, Ordering::Release);
    }
}
