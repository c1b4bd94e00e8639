//! Sync manager: the periodic outbox drain.
//!
//! Every tick the manager peeks a batch of eligible entries (the queue
//! enforces per-record ordering and next-eligibility times), pushes each
//! through the encoder, and routes the outcome through the recovery
//! context: breaker feedback, budget accounting, backoff scheduling, and
//! dead-lettering. A tick that fires while the previous drain is still in
//! flight returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inkstone_core::{classify, ErrorCategory, OutboxQueue, RowStore};
use inkstone_domain::constants::{DEFAULT_SYNC_BATCH_SIZE, DEFAULT_SYNC_INTERVAL_MS};
use inkstone_domain::{AttemptRecord, AuthState, NewOutboxEntry, OutboxEntry, Result};
use inkstone_common::resilience::CircuitState;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::settings::PersistencePolicy;
use crate::sync::encoder::UpsertEncoder;
use crate::sync::recovery::RecoveryContext;

/// Configuration for the sync manager.
#[derive(Debug, Clone)]
pub struct SyncManagerConfig {
    /// Interval between drain ticks.
    pub tick_interval: Duration,
    /// Entries peeked per tick.
    pub batch_size: usize,
    /// Join timeout when stopping.
    pub join_timeout: Duration,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// The drain was skipped entirely (gated, reentrant, or paused).
    pub skipped: bool,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Entries deferred by budget exhaustion.
    pub deferred: usize,
}

/// Periodic outbox drain with explicit lifecycle management.
pub struct SyncManager {
    outbox: Arc<dyn OutboxQueue>,
    encoder: Arc<UpsertEncoder>,
    row_store: Arc<dyn RowStore>,
    policy: Arc<PersistencePolicy>,
    recovery: Arc<RecoveryContext>,
    config: SyncManagerConfig,
    /// Identifies this drain when stamping entries as in-flight.
    owner: String,
    /// Reentrancy guard: a tick that fires mid-drain returns immediately.
    drain_in_flight: Arc<AtomicBool>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl SyncManager {
    pub fn new(
        outbox: Arc<dyn OutboxQueue>,
        encoder: Arc<UpsertEncoder>,
        row_store: Arc<dyn RowStore>,
        policy: Arc<PersistencePolicy>,
        recovery: Arc<RecoveryContext>,
        config: SyncManagerConfig,
    ) -> Self {
        Self {
            outbox,
            encoder,
            row_store,
            policy,
            recovery,
            config,
            owner: format!("drain-{}", Uuid::new_v4()),
            drain_in_flight: Arc::new(AtomicBool::new(false)),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Start the periodic drain task.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(inkstone_domain::EngineError::Internal(
                "sync manager already running".into(),
            ));
        }

        info!("starting sync manager");
        self.cancellation = CancellationToken::new();

        // Entries stranded in `syncing` by a previous process are
        // re-eligible before the first tick.
        let recovered = self.outbox.recover_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "recovered stranded in-flight entries");
        }

        let drainer = Drainer {
            outbox: Arc::clone(&self.outbox),
            encoder: Arc::clone(&self.encoder),
            row_store: Arc::clone(&self.row_store),
            policy: Arc::clone(&self.policy),
            recovery: Arc::clone(&self.recovery),
            batch_size: self.config.batch_size,
            owner: self.owner.clone(),
            drain_in_flight: Arc::clone(&self.drain_in_flight),
        };
        let interval = self.config.tick_interval;
        let cancel = self.cancellation.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("sync manager loop cancelled");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        if let Err(err) = drainer.drain_once().await {
                            error!(error = %err, "drain tick failed");
                        }
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        info!("sync manager started");
        Ok(())
    }

    /// Stop the drain task; an in-flight drain finishes naturally.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(inkstone_domain::EngineError::Internal("sync manager not running".into()));
        }

        info!("stopping sync manager");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            match tokio::time::timeout(self.config.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "sync manager task panicked");
                }
                Err(_) => {
                    warn!("sync manager task did not stop within timeout");
                }
            }
        }

        info!("sync manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Run one drain pass immediately (also used by tests).
    pub async fn drain_once(&self) -> Result<DrainSummary> {
        Drainer {
            outbox: Arc::clone(&self.outbox),
            encoder: Arc::clone(&self.encoder),
            row_store: Arc::clone(&self.row_store),
            policy: Arc::clone(&self.policy),
            recovery: Arc::clone(&self.recovery),
            batch_size: self.config.batch_size,
            owner: self.owner.clone(),
            drain_in_flight: Arc::clone(&self.drain_in_flight),
        }
        .drain_once()
        .await
    }

    /// Re-enqueue a dead letter as a fresh outbox entry. The dead letter
    /// stays in the queue until the retry succeeds.
    pub async fn retry_dead_letter(&self, dead_letter_id: &str) -> Result<i64> {
        let letter = self.recovery.dlq.get(dead_letter_id).await?.ok_or_else(|| {
            inkstone_domain::EngineError::NotFound(format!(
                "dead letter {dead_letter_id} not found"
            ))
        })?;

        let entry = match letter.action {
            inkstone_domain::OutboxAction::Upsert => NewOutboxEntry::upsert(letter.record.clone()),
            inkstone_domain::OutboxAction::Delete => NewOutboxEntry::delete(letter.record.clone()),
        }
        .from_dead_letter(letter.id.clone());

        let id = self.outbox.enqueue(entry).await?;
        info!(dead_letter_id, outbox_id = id, "dead letter re-enqueued");
        Ok(id)
    }

    /// Re-enqueue every dead letter.
    pub async fn retry_all_dead_letters(&self) -> Result<usize> {
        let letters = self.recovery.dlq.list().await?;
        let mut retried = 0;
        for letter in letters {
            self.retry_dead_letter(&letter.id).await?;
            retried += 1;
        }
        Ok(retried)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("sync manager dropped while running, cancelling");
            self.cancellation.cancel();
        }
    }
}

/// The drain pass itself, shared by the background loop and `drain_once`.
struct Drainer {
    outbox: Arc<dyn OutboxQueue>,
    encoder: Arc<UpsertEncoder>,
    row_store: Arc<dyn RowStore>,
    policy: Arc<PersistencePolicy>,
    recovery: Arc<RecoveryContext>,
    batch_size: usize,
    owner: String,
    drain_in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag on drop, so a drain that unwinds cannot
/// leave the reentrancy guard wedged and silently disable future ticks.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drainer {
    async fn drain_once(&self) -> Result<DrainSummary> {
        // Reentrancy guard: a second tick while one is running is a no-op.
        if self.drain_in_flight.swap(true, Ordering::AcqRel) {
            debug!("drain already in flight, skipping tick");
            return Ok(DrainSummary { skipped: true, ..DrainSummary::default() });
        }

        let _in_flight = InFlightGuard(&self.drain_in_flight);
        self.drain_guarded().await
    }

    async fn drain_guarded(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        if !self.policy.allows_sync() {
            debug!("persistence mode is local-only, skipping drain");
            summary.skipped = true;
            return Ok(summary);
        }

        match self.row_store.auth_state().await {
            Ok(AuthState::Authenticated { .. }) => {}
            Ok(AuthState::Anonymous) => {
                debug!("not authenticated, skipping drain");
                summary.skipped = true;
                return Ok(summary);
            }
            Err(err) => {
                debug!(error = %err, "remote unreachable, skipping drain");
                summary.skipped = true;
                return Ok(summary);
            }
        }

        let now = Utc::now().timestamp_millis();

        // Retention runs on the drain cadence whether or not there is work.
        self.recovery.dlq.cleanup(now).await?;

        let entries = self.outbox.peek(self.batch_size, now).await?;
        if entries.is_empty() {
            return Ok(summary);
        }

        debug!(count = entries.len(), "draining outbox batch");

        for entry in entries {
            if !self.recovery.breaker.can_execute() {
                info!("circuit open, sync paused for this batch");
                summary.skipped = true;
                break;
            }

            // Budget throttles retries only; first attempts always flow.
            if entry.attempts > 0 && !self.recovery.budget.can_retry() {
                debug!(entry_id = entry.id, "retry budget exhausted, deferring entry");
                self.recovery.stats.record_budget_exhaustion();
                summary.deferred += 1;
                continue;
            }

            self.outbox.mark_syncing(&[entry.id], &self.owner).await?;
            self.recovery.stats.record_operation();

            match self.encoder.push_entry(&entry).await {
                Ok(()) => {
                    self.handle_success(&entry).await?;
                    summary.succeeded += 1;
                }
                Err(failure) => {
                    let dead = self.handle_failure(&entry, &failure).await?;
                    if dead {
                        summary.dead_lettered += 1;
                    } else {
                        summary.retried += 1;
                    }
                }
            }
        }

        self.policy.touch_last_sync(now).await?;

        Ok(summary)
    }

    async fn handle_success(&self, entry: &OutboxEntry) -> Result<()> {
        self.outbox.mark_success(entry.id).await?;
        self.recovery.breaker.record_success();
        self.recovery.stats.record_success();

        // A successful retry of a dead letter resolves it.
        if let Some(dead_letter_id) = &entry.origin_dead_letter {
            match self.recovery.dlq.remove(dead_letter_id).await {
                Ok(()) => debug!(dead_letter_id = %dead_letter_id, "dead letter resolved"),
                Err(inkstone_domain::EngineError::NotFound(_)) => {}
                Err(err) => {
                    warn!(dead_letter_id = %dead_letter_id, error = %err,
                        "failed to resolve dead letter");
                }
            }
        }

        debug!(entry_id = entry.id, "entry delivered");
        Ok(())
    }

    /// Route a failed push; returns true when the entry dead-lettered.
    async fn handle_failure(
        &self,
        entry: &OutboxEntry,
        failure: &inkstone_core::SyncFailure,
    ) -> Result<bool> {
        let classified = classify(failure);
        self.recovery.stats.record_failure(classified.category);

        // Auth failures mean the session expired, not that the remote is
        // unhealthy; they do not count toward the breaker.
        if classified.category != ErrorCategory::Authentication {
            let was_open = self.recovery.breaker.state() == CircuitState::Open;
            self.recovery.breaker.record_failure();
            if !was_open && self.recovery.breaker.state() == CircuitState::Open {
                self.recovery.stats.record_circuit_trip();
            }
        }

        let attempt_number = entry.attempts + 1;
        let terminal = !classified.is_retryable || attempt_number >= self.recovery.max_attempts;

        if terminal {
            self.outbox
                .send_to_dlq(entry.id, &classified.message, classified.category.as_str())
                .await?;
            self.recovery.stats.record_dead_letter();
            error!(
                entry_id = entry.id,
                record_id = %entry.record_id,
                category = %classified.category,
                attempts = attempt_number,
                "entry permanently failed"
            );
            return Ok(true);
        }

        let delay = self.recovery.backoff.delay(
            attempt_number,
            classified.suggested_delay,
            classified.retry_after,
        );
        self.recovery.budget.record_retry();
        self.recovery.stats.record_retry(delay);

        let now = Utc::now().timestamp_millis();
        let attempt = AttemptRecord {
            attempt: attempt_number,
            message: truncate(&classified.message, 256),
            category: classified.category.as_str().to_string(),
            delay_ms: delay.as_millis() as u64,
            at: now,
        };
        let next_attempt_at = now + delay.as_millis() as i64;
        self.outbox.mark_failed(entry.id, attempt, next_attempt_at).await?;

        warn!(
            entry_id = entry.id,
            record_id = %entry.record_id,
            category = %classified.category,
            attempt = attempt_number,
            delay_ms = delay.as_millis() as u64,
            "entry failed, retry scheduled"
        );
        Ok(false)
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
