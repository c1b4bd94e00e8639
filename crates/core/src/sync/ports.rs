//! Port interfaces for sync operations.
//!
//! The services in `inkstone-infra` are written against these traits so
//! tests can substitute in-memory fakes for SQLite and the remote row
//! store.

use async_trait::async_trait;
use inkstone_domain::{
    AttemptRecord, AuthState, DeadLetter, NewOutboxEntry, OutboxEntry, OutboxStats,
    PersistenceSettings, Record, RecordTable, RemoteError, RemoteRow, Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Durable per-record storage, indexed by `(table, id)`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch one record (live or tombstoned) by its key. The key carries no
    /// project scope, so realtime events that arrive with a bare id can
    /// still locate the record.
    async fn get(&self, table: RecordTable, id: &str) -> Result<Option<Record>>;

    /// List live records of a table within a project.
    async fn list(&self, table: RecordTable, project_id: &str) -> Result<Vec<Record>>;

    /// List every live top-level project record (used by bootstrap and by
    /// mode-switch migration).
    async fn list_projects(&self) -> Result<Vec<Record>>;

    /// List records (tombstones included) modified strictly after `since`.
    async fn list_since(
        &self,
        table: RecordTable,
        project_id: &str,
        since: i64,
    ) -> Result<Vec<Record>>;

    /// Write a record, replacing any existing row with the same key.
    async fn put(&self, record: &Record) -> Result<()>;

    /// Write a tombstone for the record at time `at`. A tombstone older
    /// than the stored record loses the merge and leaves it untouched;
    /// `updated_at` never decreases.
    async fn delete(&self, table: RecordTable, id: &str, at: i64) -> Result<()>;
}

/// Append-only queue of pending mutations, FIFO within a record key.
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Append an entry; returns the assigned monotonic id.
    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<i64>;

    /// Next up to `limit` eligible entries in order, as of `now` (millis).
    ///
    /// An entry is skipped while an earlier entry for the same
    /// `(table, record_id)` is still pending or in flight, and while its
    /// own `next_attempt_at` lies in the future.
    async fn peek(&self, limit: usize, now: i64) -> Result<Vec<OutboxEntry>>;

    /// Stamp entries as in-flight under a drain owner.
    async fn mark_syncing(&self, ids: &[i64], owner: &str) -> Result<()>;

    /// Acknowledge delivery; the entry is removed from the queue.
    async fn mark_success(&self, id: i64) -> Result<()>;

    /// Record a failed attempt and schedule the next eligibility.
    async fn mark_failed(&self, id: i64, attempt: AttemptRecord, next_attempt_at: i64)
        -> Result<()>;

    /// Atomically move the entry into the dead-letter queue. Returns the
    /// new dead letter id.
    async fn send_to_dlq(&self, id: i64, final_error: &str, final_category: &str) -> Result<String>;

    /// Reset entries stranded in `syncing` (e.g. after a crash) back to
    /// `pending`. Returns how many were recovered.
    async fn recover_in_flight(&self) -> Result<usize>;

    /// Queue depth by status.
    async fn drain_stats(&self) -> Result<OutboxStats>;
}

/// Store for permanently failed operations.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, letter: DeadLetter) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DeadLetter>>;

    /// All dead letters, newest first.
    async fn list(&self) -> Result<Vec<DeadLetter>>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Evict letters past the retention age or beyond the size bound,
    /// oldest first. Returns how many were evicted.
    async fn cleanup(&self, now: i64) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// The remote row store, abstracted per its upsert/select/auth contract.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Idempotent single-row write keyed by `on_conflict`.
    async fn upsert_row(
        &self,
        table: RecordTable,
        row: &RemoteRow,
        on_conflict: &str,
    ) -> std::result::Result<(), RemoteError>;

    /// Rows of a table within a project, excluding deleted rows, optionally
    /// restricted to `updated_at > since`.
    async fn fetch_rows(
        &self,
        table: RecordTable,
        project_id: &str,
        since: Option<i64>,
    ) -> std::result::Result<Vec<RemoteRow>, RemoteError>;

    /// Look up a single project row for bootstrap decisions.
    async fn fetch_project(
        &self,
        project_id: &str,
    ) -> std::result::Result<Option<RemoteRow>, RemoteError>;

    /// Every project row visible to the current user (used by
    /// import-from-cloud migration).
    async fn fetch_all_projects(&self) -> std::result::Result<Vec<RemoteRow>, RemoteError>;

    /// Current authentication state.
    async fn auth_state(&self) -> std::result::Result<AuthState, RemoteError>;
}

/// Kind of change pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealtimeEventType {
    Insert,
    Update,
    Delete,
}

/// One server-push change on a subscribed table.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub event_type: RealtimeEventType,
    pub new: Option<RemoteRow>,
    pub old: Option<RemoteRow>,
}

impl ChangeEvent {
    /// Record id the event refers to, preferring the new row.
    pub fn record_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .map(|row| row.id.as_str())
            .or_else(|| self.old.as_ref().map(|row| row.id.as_str()))
    }
}

/// Messages delivered on a realtime channel.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// The channel is live.
    Subscribed,
    /// A row changed.
    Change(ChangeEvent),
    /// The subscription timed out; the router should reconnect.
    TimedOut,
    /// The channel errored; the router should reconnect.
    ChannelError(String),
    /// The channel was closed by the transport.
    Closed,
}

/// A live channel for one `(project, table)` pair.
pub struct ChannelSubscription {
    pub receiver: mpsc::Receiver<ChannelMessage>,
}

/// Transport delivering server-push change events.
///
/// The concrete websocket implementation lives outside the engine; tests
/// drive the router through an in-process channel transport.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a channel filtered to one project and table.
    async fn subscribe(
        &self,
        project_id: &str,
        table: RecordTable,
    ) -> std::result::Result<ChannelSubscription, RemoteError>;

    /// Tear down the channel for one project and table.
    async fn unsubscribe(
        &self,
        project_id: &str,
        table: RecordTable,
    ) -> std::result::Result<(), RemoteError>;
}

/// A project's wrapped data-encryption key at rest.
///
/// Only wrapped material is ever persisted; the unwrapped DEK exists in
/// memory inside the key manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedProjectKey {
    pub project_id: String,
    /// Current DEK, wrapped under the passphrase-derived KEK.
    pub wrapped_dek: String,
    /// Previous DEK kept through a rotation window so reads can try both.
    pub previous_wrapped_dek: Option<String>,
    pub created_at: i64,
    pub rotated_at: Option<i64>,
}

/// Persistence for wrapped project keys.
#[async_trait]
pub trait WrappedKeyStore: Send + Sync {
    async fn load(&self, project_id: &str) -> Result<Option<WrappedProjectKey>>;

    async fn store(&self, key: &WrappedProjectKey) -> Result<()>;

    async fn remove(&self, project_id: &str) -> Result<()>;
}

/// Persistence for engine settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load settings, falling back to defaults on first run.
    async fn load(&self) -> Result<PersistenceSettings>;

    async fn save(&self, settings: &PersistenceSettings) -> Result<()>;
}
