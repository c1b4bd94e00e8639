//! Outbox entries: pending local mutations awaiting remote acknowledgement.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::records::{Record, RecordTable};

/// The mutation an outbox entry propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxAction {
    Upsert,
    Delete,
}

impl fmt::Display for OutboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxAction::Upsert => f.write_str("upsert"),
            OutboxAction::Delete => f.write_str("delete"),
        }
    }
}

impl FromStr for OutboxAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(OutboxAction::Upsert),
            "delete" => Ok(OutboxAction::Delete),
            other => Err(EngineError::InvalidInput(format!("unknown outbox action: {other}"))),
        }
    }
}

/// Lifecycle state of an outbox entry.
///
/// `Success` and `Dead` are terminal: a successful entry is removed from the
/// queue on acknowledgement and a dead entry moves into the dead-letter
/// queue atomically, so neither state is normally observable at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Syncing,
    Success,
    Failed,
    Dead,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Syncing => "syncing",
            OutboxStatus::Success => "success",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "syncing" => Ok(OutboxStatus::Syncing),
            "success" => Ok(OutboxStatus::Success),
            "failed" => Ok(OutboxStatus::Failed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(EngineError::InvalidInput(format!("unknown outbox status: {other}"))),
        }
    }
}

/// One failed delivery attempt, retained as history until the entry is
/// acknowledged or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error message, truncated by the recorder.
    pub message: String,
    /// Classifier category name for the failure.
    pub category: String,
    /// Backoff delay scheduled after this attempt, in milliseconds.
    pub delay_ms: u64,
    /// When the attempt failed, milliseconds since the Unix epoch.
    pub at: i64,
}

/// A mutation to append to the outbox. The queue assigns the monotonic id.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub table: RecordTable,
    pub record_id: String,
    pub project_id: Option<String>,
    pub action: OutboxAction,
    /// Snapshot of the record at enqueue time.
    pub record: Record,
    /// Dead letter this entry was re-enqueued from, if any. Successful
    /// delivery resolves the linked dead letter.
    pub origin_dead_letter: Option<String>,
}

impl NewOutboxEntry {
    /// Build an upsert entry from a record snapshot.
    pub fn upsert(record: Record) -> Self {
        Self::with_action(record, OutboxAction::Upsert)
    }

    /// Build a delete entry from a tombstoned record snapshot.
    pub fn delete(record: Record) -> Self {
        Self::with_action(record, OutboxAction::Delete)
    }

    fn with_action(record: Record, action: OutboxAction) -> Self {
        Self {
            table: record.table,
            record_id: record.id.clone(),
            project_id: record.scope_project_id().map(str::to_owned),
            action,
            record,
            origin_dead_letter: None,
        }
    }

    /// Link this entry to the dead letter it retries.
    pub fn from_dead_letter(mut self, dead_letter_id: impl Into<String>) -> Self {
        self.origin_dead_letter = Some(dead_letter_id.into());
        self
    }
}

/// A persisted outbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic queue id, distinct from the record id.
    pub id: i64,
    pub table: RecordTable,
    pub record_id: String,
    pub project_id: Option<String>,
    pub action: OutboxAction,
    /// Snapshot of the record at enqueue time.
    pub record: Record,
    pub status: OutboxStatus,
    pub attempts: u32,
    /// Drain owner while the entry is `Syncing`, preventing a second drain
    /// from re-issuing it concurrently.
    pub owner: Option<String>,
    pub origin_dead_letter: Option<String>,
    /// Earliest next delivery eligibility, milliseconds since the Unix epoch.
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Ordered failure history.
    pub history: Vec<AttemptRecord>,
}

impl OutboxEntry {
    /// Key identifying the per-record FIFO lane.
    pub fn record_key(&self) -> (RecordTable, &str) {
        (self.table, self.record_id.as_str())
    }
}

/// Queue depth by status, as reported by `drain_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}
