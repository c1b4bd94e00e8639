//! Realtime router: server-push change events into the hydration path.
//!
//! One channel per `(project, table)`. Bursts of changes on the same
//! record collapse through a trailing debounce before a single-table
//! hydration runs; DELETE events apply the tombstone directly. Events
//! fingerprinted with this client's own id are suppressed.
//!
//! Timer hygiene is a correctness requirement here, not an optimization:
//! every debounce timer is reference-tracked per project and
//! `unsubscribe_from_project` aborts and clears all of them before it
//! returns, along with every channel task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inkstone_core::{
    remote_wins, ChangeEvent, ChannelMessage, LocalStore, RealtimeEventType, RealtimeTransport,
};
use inkstone_domain::constants::{DEFAULT_CHANGE_DEBOUNCE_MS, DEFAULT_RECONNECT_DELAY_MS};
use inkstone_domain::{EngineError, RecordTable, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::hydration::{HydrationRequest, HydrationService};

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RealtimeRouterConfig {
    /// Trailing debounce per `(table, record_id)`.
    pub change_debounce: Duration,
    /// Wait before re-subscribing after a channel failure.
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
}

impl Default for RealtimeRouterConfig {
    fn default() -> Self {
        Self {
            change_debounce: Duration::from_millis(DEFAULT_CHANGE_DEBOUNCE_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            auto_reconnect: true,
        }
    }
}

/// Aggregate connection status for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Every table channel is live.
    Connected,
    /// At least one channel is down (or the project is not subscribed).
    Disconnected,
}

/// Reference-tracked debounce timers for one project.
///
/// Generations disambiguate a stale timer's self-removal from a newer
/// timer that replaced it under the same key.
struct DebounceTimers {
    next_generation: AtomicU64,
    timers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
}

impl DebounceTimers {
    fn new() -> Arc<Self> {
        Arc::new(Self { next_generation: AtomicU64::new(0), timers: Mutex::new(HashMap::new()) })
    }

    /// (Re)arm the timer for `key`: the previous timer is aborted so a
    /// burst collapses into one trailing run.
    fn schedule<F>(registry: &Arc<Self>, key: String, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let cleanup_registry = Arc::clone(registry);
        let cleanup_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;

            let mut timers = cleanup_registry.timers.lock();
            if timers.get(&cleanup_key).is_some_and(|(gen, _)| *gen == generation) {
                timers.remove(&cleanup_key);
            }
        });

        let mut timers = registry.timers.lock();
        if let Some((_, previous)) = timers.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    /// Abort every pending timer and drop the handles.
    fn clear_all(&self) {
        let mut timers = self.timers.lock();
        for (_, (_, handle)) in timers.drain() {
            handle.abort();
        }
    }

    fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

struct ProjectChannels {
    cancel: CancellationToken,
    channel_tasks: Vec<JoinHandle<()>>,
    debounce: Arc<DebounceTimers>,
    connected: Arc<Mutex<HashMap<RecordTable, bool>>>,
}

/// Routes server-push change events into hydration and tombstone applies.
pub struct RealtimeRouter {
    transport: Arc<dyn RealtimeTransport>,
    hydration: Arc<HydrationService>,
    local: Arc<dyn LocalStore>,
    /// This installation's fingerprint; matching events are our own echo.
    client_id: String,
    config: RealtimeRouterConfig,
    projects: Mutex<HashMap<String, ProjectChannels>>,
}

impl RealtimeRouter {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        hydration: Arc<HydrationService>,
        local: Arc<dyn LocalStore>,
        client_id: impl Into<String>,
        config: RealtimeRouterConfig,
    ) -> Self {
        Self {
            transport,
            hydration,
            local,
            client_id: client_id.into(),
            config,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe one channel per table for the project. Idempotent.
    #[instrument(skip(self))]
    pub async fn subscribe_to_project(&self, project_id: &str) -> Result<()> {
        if self.projects.lock().contains_key(project_id) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let debounce = DebounceTimers::new();
        let connected = Arc::new(Mutex::new(HashMap::new()));

        let mut channel_tasks = Vec::with_capacity(RecordTable::HYDRATION_ORDER.len());
        for table in RecordTable::HYDRATION_ORDER {
            let worker = ChannelWorker {
                transport: Arc::clone(&self.transport),
                hydration: Arc::clone(&self.hydration),
                local: Arc::clone(&self.local),
                debounce: Arc::clone(&debounce),
                connected: Arc::clone(&connected),
                client_id: self.client_id.clone(),
                project_id: project_id.to_owned(),
                table,
                change_debounce: self.config.change_debounce,
                reconnect_delay: self.config.reconnect_delay,
                auto_reconnect: self.config.auto_reconnect,
                cancel: cancel.clone(),
            };
            channel_tasks.push(tokio::spawn(worker.run()));
        }

        self.projects.lock().insert(
            project_id.to_owned(),
            ProjectChannels { cancel, channel_tasks, debounce, connected },
        );

        info!(project_id, "realtime subscriptions opened");
        Ok(())
    }

    /// Tear down every channel for the project and clear every debounce
    /// timer keyed to its tables.
    #[instrument(skip(self))]
    pub async fn unsubscribe_from_project(&self, project_id: &str) -> Result<()> {
        let Some(channels) = self.projects.lock().remove(project_id) else {
            return Ok(());
        };

        channels.cancel.cancel();
        for handle in channels.channel_tasks {
            handle.abort();
        }
        channels.debounce.clear_all();

        for table in RecordTable::HYDRATION_ORDER {
            if let Err(err) = self.transport.unsubscribe(project_id, table).await {
                warn!(table = %table, error = %err, "transport unsubscribe failed");
            }
        }

        info!(project_id, "realtime subscriptions closed");
        Ok(())
    }

    /// Aggregate channel status for a project.
    pub fn status(&self, project_id: &str) -> ConnectionStatus {
        let projects = self.projects.lock();
        let Some(channels) = projects.get(project_id) else {
            return ConnectionStatus::Disconnected;
        };

        let connected = channels.connected.lock();
        let all_live = RecordTable::HYDRATION_ORDER
            .iter()
            .all(|table| connected.get(table).copied().unwrap_or(false));
        if all_live {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// Debounce timers currently pending for a project (observability and
    /// leak tests).
    pub fn pending_timers(&self, project_id: &str) -> usize {
        self.projects.lock().get(project_id).map(|c| c.debounce.pending()).unwrap_or(0)
    }
}

/// One channel's subscribe/consume/reconnect loop.
struct ChannelWorker {
    transport: Arc<dyn RealtimeTransport>,
    hydration: Arc<HydrationService>,
    local: Arc<dyn LocalStore>,
    debounce: Arc<DebounceTimers>,
    connected: Arc<Mutex<HashMap<RecordTable, bool>>>,
    client_id: String,
    project_id: String,
    table: RecordTable,
    change_debounce: Duration,
    reconnect_delay: Duration,
    auto_reconnect: bool,
    cancel: CancellationToken,
}

impl ChannelWorker {
    async fn run(self) {
        loop {
            let subscription = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.transport.subscribe(&self.project_id, self.table) => result,
            };

            match subscription {
                Ok(mut subscription) => {
                    self.consume(&mut subscription.receiver).await;
                }
                Err(err) => {
                    warn!(
                        project_id = %self.project_id,
                        table = %self.table,
                        error = %err,
                        "realtime subscribe failed"
                    );
                }
            }

            self.set_connected(false);
            if !self.auto_reconnect {
                return;
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn consume(&self, receiver: &mut tokio::sync::mpsc::Receiver<ChannelMessage>) {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return,
                message = receiver.recv() => message,
            };

            match message {
                Some(ChannelMessage::Subscribed) => {
                    debug!(project_id = %self.project_id, table = %self.table, "channel live");
                    self.set_connected(true);
                }
                Some(ChannelMessage::Change(event)) => self.handle_change(event).await,
                Some(ChannelMessage::TimedOut) => {
                    warn!(project_id = %self.project_id, table = %self.table, "channel timed out");
                    return;
                }
                Some(ChannelMessage::ChannelError(error)) => {
                    warn!(
                        project_id = %self.project_id,
                        table = %self.table,
                        error = %error,
                        "channel error"
                    );
                    return;
                }
                Some(ChannelMessage::Closed) | None => return,
            }
        }
    }

    async fn handle_change(&self, event: ChangeEvent) {
        if self.is_own_echo(&event) {
            debug!(table = %self.table, "own change echoed back, suppressed");
            return;
        }

        match event.event_type {
            RealtimeEventType::Delete => self.apply_tombstone(&event).await,
            RealtimeEventType::Insert | RealtimeEventType::Update => {
                let Some(record_id) = event.record_id() else {
                    warn!(table = %self.table, "change event without a record id");
                    return;
                };

                let key = format!("{}:{}", self.table, record_id);
                let hydration = Arc::clone(&self.hydration);
                let request = HydrationRequest::table(self.project_id.clone(), self.table);
                DebounceTimers::schedule(&self.debounce, key, self.change_debounce, async move {
                    hydration.hydrate_project(&request, None).await;
                });
            }
        }
    }

    /// A row written by this client carries our fingerprint; anything else
    /// (including a missing fingerprint) is external.
    fn is_own_echo(&self, event: &ChangeEvent) -> bool {
        event
            .new
            .as_ref()
            .and_then(|row| row.client_id.as_deref())
            .is_some_and(|id| id == self.client_id)
    }

    /// Tombstones merge by the same rule as record updates: the remote
    /// delete applies only when it is strictly newer than the local copy.
    async fn apply_tombstone(&self, event: &ChangeEvent) {
        // DELETE events may arrive with only the row id on `old`; the
        // local store is keyed by (table, id) so that is enough context.
        let source = event.old.as_ref().or(event.new.as_ref());
        let Some(row) = source else {
            warn!(table = %self.table, "delete event without row context");
            return;
        };

        let at = if row.updated_at > 0 { row.updated_at } else { Utc::now().timestamp_millis() };

        let local = match self.local.get(self.table, &row.id).await {
            Ok(Some(local)) => local,
            Ok(None) => {
                debug!(table = %self.table, row_id = %row.id, "delete for unknown record ignored");
                return;
            }
            Err(err) => {
                warn!(table = %self.table, row_id = %row.id, error = %err, "tombstone lookup failed");
                return;
            }
        };

        if !remote_wins(Some(&local), at) {
            debug!(table = %self.table, row_id = %row.id, "stale delete lost to local edit");
            return;
        }

        match self.local.delete(self.table, &row.id, at).await {
            Ok(()) => debug!(table = %self.table, row_id = %row.id, "tombstone applied"),
            Err(EngineError::NotFound(_)) => {
                debug!(table = %self.table, row_id = %row.id, "record vanished before tombstone");
            }
            Err(err) => {
                warn!(table = %self.table, row_id = %row.id, error = %err, "tombstone apply failed");
            }
        }
    }

    fn set_connected(&self, live: bool) {
        self.connected.lock().insert(self.table, live);
    }
}
