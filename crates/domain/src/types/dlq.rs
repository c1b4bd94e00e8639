//! Dead letters: operations evicted from the outbox after terminal failure.

use serde::{Deserialize, Serialize};

use crate::types::outbox::{AttemptRecord, OutboxAction};
use crate::types::records::{Record, RecordTable};

/// A permanently failed operation awaiting manual attention.
///
/// Destroyed by manual clear, successful manual retry, or retention expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead letter id, distinct from outbox and record ids.
    pub id: String,
    pub table: RecordTable,
    pub record_id: String,
    pub project_id: Option<String>,
    pub action: OutboxAction,
    /// Record snapshot copied from the evicted outbox entry; a manual retry
    /// re-enqueues exactly this payload.
    pub record: Record,
    /// Final error message that sealed the entry's fate.
    pub final_error: String,
    /// Classifier category of the final error.
    pub final_category: String,
    /// Full attempt history carried over from the outbox entry.
    pub history: Vec<AttemptRecord>,
    /// When the operation was dead-lettered, milliseconds since the Unix
    /// epoch.
    pub dead_at: i64,
}
