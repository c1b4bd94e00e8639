//! Records stored by the local store.
//!
//! A [`Record`] is the unit of synchronization: one row in one of the
//! writing-project tables, carrying a table-specific payload the engine
//! treats as opaque JSON. A record with `deleted_at` set is a tombstone and
//! must propagate to the remote until both sides agree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;

/// Tables the sync engine manages.
///
/// `HYDRATION_ORDER` fixes the bootstrap order: `projects` rows must land
/// locally before any child row in that project becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordTable {
    Projects,
    ProjectSettings,
    Chapters,
    Sections,
    Characters,
    Notes,
}

impl RecordTable {
    /// All tables in hydration order, parents first.
    pub const HYDRATION_ORDER: [RecordTable; 6] = [
        RecordTable::Projects,
        RecordTable::ProjectSettings,
        RecordTable::Chapters,
        RecordTable::Sections,
        RecordTable::Characters,
        RecordTable::Notes,
    ];

    /// Stable string name used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordTable::Projects => "projects",
            RecordTable::ProjectSettings => "project_settings",
            RecordTable::Chapters => "chapters",
            RecordTable::Sections => "sections",
            RecordTable::Characters => "characters",
            RecordTable::Notes => "notes",
        }
    }

    /// Column the remote upsert conflicts on.
    ///
    /// `project_settings` rows are keyed by their project rather than a row
    /// id of their own.
    pub fn conflict_column(self) -> &'static str {
        match self {
            RecordTable::ProjectSettings => "project_id",
            _ => "id",
        }
    }

    /// Whether rows in this table require a parent `project_id`.
    pub fn requires_project_id(self) -> bool {
        !matches!(self, RecordTable::Projects)
    }
}

impl fmt::Display for RecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordTable {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(RecordTable::Projects),
            "project_settings" => Ok(RecordTable::ProjectSettings),
            "chapters" => Ok(RecordTable::Chapters),
            "sections" => Ok(RecordTable::Sections),
            "characters" => Ok(RecordTable::Characters),
            "notes" => Ok(RecordTable::Notes),
            other => Err(EngineError::InvalidInput(format!("unknown record table: {other}"))),
        }
    }
}

/// A single versioned record in the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Opaque stable identifier, unique per table.
    pub id: String,
    /// Table this record belongs to.
    pub table: RecordTable,
    /// Parent project reference; `None` on top-level `projects` rows.
    pub project_id: Option<String>,
    /// Last-modified wall clock, milliseconds since the Unix epoch.
    pub updated_at: i64,
    /// Tombstone marker; non-null means the record is deleted.
    pub deleted_at: Option<i64>,
    /// Table-specific payload, opaque to the sync engine.
    pub payload: Value,
    /// Monotonic per-record revision, present when E2EE is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_rev: Option<i64>,
    /// Content digest, present when E2EE is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_hash: Option<String>,
}

impl Record {
    /// True when this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Effective project scope: the record's own id for `projects` rows,
    /// otherwise the parent reference.
    pub fn scope_project_id(&self) -> Option<&str> {
        match self.table {
            RecordTable::Projects => Some(self.id.as_str()),
            _ => self.project_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_through_str() {
        for table in RecordTable::HYDRATION_ORDER {
            let parsed: RecordTable = table.as_str().parse().expect("parses");
            assert_eq!(parsed, table);
        }
    }

    #[test]
    fn unknown_table_is_rejected() {
        assert!("drawings".parse::<RecordTable>().is_err());
    }

    #[test]
    fn projects_hydrate_first() {
        assert_eq!(RecordTable::HYDRATION_ORDER[0], RecordTable::Projects);
    }

    #[test]
    fn project_settings_conflict_on_project_id() {
        assert_eq!(RecordTable::ProjectSettings.conflict_column(), "project_id");
        assert_eq!(RecordTable::Chapters.conflict_column(), "id");
    }

    #[test]
    fn scope_project_id_uses_own_id_for_projects() {
        let record = Record {
            id: "p1".into(),
            table: RecordTable::Projects,
            project_id: None,
            updated_at: 1,
            deleted_at: None,
            payload: serde_json::json!({"title": "Draft"}),
            client_rev: None,
            client_hash: None,
        };
        assert_eq!(record.scope_project_id(), Some("p1"));
    }
}
