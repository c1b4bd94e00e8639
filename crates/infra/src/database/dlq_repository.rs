//! SQLite-backed dead-letter queue.
//!
//! Holds operations evicted from the outbox after terminal failure, with
//! their full attempt history, until a manual retry, a manual clear, or
//! retention expiry removes them. Retention is both age-based and
//! size-bounded; eviction is oldest-first.

use std::sync::Arc;

use async_trait::async_trait;
use inkstone_core::DeadLetterStore;
use inkstone_domain::constants::{DLQ_MAX_ENTRIES, DLQ_RETENTION_DAYS};
use inkstone_domain::{AttemptRecord, DeadLetter, EngineError, OutboxAction, Record, Result};
use rusqlite::{Row, ToSql};
use tokio::task;
use tracing::debug;

use super::manager::{DbConnection, DbManager};
use crate::errors::{map_join_error, map_json_error, map_sqlite_error};

/// Retention policy for dead letters.
#[derive(Debug, Clone)]
pub struct DlqRetention {
    /// Maximum age before a letter expires, in milliseconds.
    pub max_age_ms: i64,
    /// Maximum number of letters retained.
    pub max_entries: usize,
}

impl Default for DlqRetention {
    fn default() -> Self {
        Self {
            max_age_ms: DLQ_RETENTION_DAYS * 24 * 60 * 60 * 1_000,
            max_entries: DLQ_MAX_ENTRIES,
        }
    }
}

/// SQLite-backed dead-letter store.
pub struct SqliteDeadLetterStore {
    db: Arc<DbManager>,
    retention: DlqRetention,
}

impl SqliteDeadLetterStore {
    /// Construct a store with default retention.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self::with_retention(db, DlqRetention::default())
    }

    /// Construct a store with explicit retention bounds.
    pub fn with_retention(db: Arc<DbManager>, retention: DlqRetention) -> Self {
        Self { db, retention }
    }

    fn insert(conn: &DbConnection, letter: &DeadLetter) -> Result<()> {
        let record_json = serde_json::to_string(&letter.record)
            .map_err(|e| map_json_error("dead letter record serialization failed", e))?;
        let history_json = serde_json::to_string(&letter.history)
            .map_err(|e| map_json_error("dead letter history serialization failed", e))?;

        let params: [&dyn ToSql; 10] = [
            &letter.id,
            &letter.table.as_str(),
            &letter.record_id,
            &letter.project_id,
            &letter.action.to_string(),
            &record_json,
            &letter.final_error,
            &letter.final_category,
            &history_json,
            &letter.dead_at,
        ];
        conn.execute(
            "INSERT OR REPLACE INTO sync_dead_letters (
                 id, tbl, record_id, project_id, action, record_json,
                 final_error, final_category, history_json, dead_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params.as_slice(),
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    fn fetch_one(conn: &DbConnection, id: &str) -> Result<Option<DeadLetter>> {
        let mut stmt = conn
            .prepare(&format!("{DLQ_SELECT_SQL} WHERE id = ?1"))
            .map_err(map_sqlite_error)?;
        let mut rows = stmt.query([&id as &dyn ToSql]).map_err(map_sqlite_error)?;

        match rows.next().map_err(map_sqlite_error)? {
            Some(row) => Ok(Some(map_dead_letter_row(row)?)),
            None => Ok(None),
        }
    }

    fn fetch_all(conn: &DbConnection) -> Result<Vec<DeadLetter>> {
        let mut stmt = conn
            .prepare(&format!("{DLQ_SELECT_SQL} ORDER BY dead_at DESC"))
            .map_err(map_sqlite_error)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_error)?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            letters.push(map_dead_letter_row(row)?);
        }
        Ok(letters)
    }

    fn evict(conn: &DbConnection, retention: &DlqRetention, now: i64) -> Result<usize> {
        let cutoff = now.saturating_sub(retention.max_age_ms);
        let expired = conn
            .execute(
                "DELETE FROM sync_dead_letters WHERE dead_at < ?1",
                [&cutoff as &dyn ToSql],
            )
            .map_err(map_sqlite_error)?;

        // Size bound: keep only the newest max_entries letters.
        let max_entries = i64::try_from(retention.max_entries).unwrap_or(i64::MAX);
        let overflow = conn
            .execute(
                "DELETE FROM sync_dead_letters WHERE id NOT IN (
                     SELECT id FROM sync_dead_letters ORDER BY dead_at DESC LIMIT ?1
                 )",
                [&max_entries as &dyn ToSql],
            )
            .map_err(map_sqlite_error)?;

        if expired + overflow > 0 {
            debug!(expired, overflow, "dead letters evicted");
        }
        Ok(expired + overflow)
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn add(&self, letter: DeadLetter) -> Result<()> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::insert(&conn, &letter)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetter>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<Option<DeadLetter>> {
            let conn = db.get_connection()?;
            Self::fetch_one(&conn, &id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list(&self) -> Result<Vec<DeadLetter>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<DeadLetter>> {
            let conn = db.get_connection()?;
            Self::fetch_all(&conn)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            let deleted = conn
                .execute("DELETE FROM sync_dead_letters WHERE id = ?1", [&id as &dyn ToSql])
                .map_err(map_sqlite_error)?;
            if deleted == 0 {
                Err(EngineError::NotFound(format!("dead letter {id} not found")))
            } else {
                Ok(())
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn cleanup(&self, now: i64) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let retention = self.retention.clone();

        task::spawn_blocking(move || -> Result<usize> {
            let conn = db.get_connection()?;
            Self::evict(&conn, &retention, now)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn clear(&self) -> Result<()> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            conn.execute("DELETE FROM sync_dead_letters", []).map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}

const DLQ_SELECT_SQL: &str = "SELECT
        id, tbl, record_id, project_id, action, record_json,
        final_error, final_category, history_json, dead_at
    FROM sync_dead_letters";

fn map_dead_letter_row(row: &Row<'_>) -> Result<DeadLetter> {
    let table_raw: String = row.get(1).map_err(map_sqlite_error)?;
    let action_raw: String = row.get(4).map_err(map_sqlite_error)?;
    let record_json: String = row.get(5).map_err(map_sqlite_error)?;
    let history_json: String = row.get(8).map_err(map_sqlite_error)?;

    let record: Record = serde_json::from_str(&record_json)
        .map_err(|e| map_json_error("dead letter record decode failed", e))?;
    let history: Vec<AttemptRecord> = serde_json::from_str(&history_json)
        .map_err(|e| map_json_error("dead letter history decode failed", e))?;

    Ok(DeadLetter {
        id: row.get(0).map_err(map_sqlite_error)?,
        table: table_raw.parse()?,
        record_id: row.get(2).map_err(map_sqlite_error)?,
        project_id: row.get(3).map_err(map_sqlite_error)?,
        action: action_raw.parse::<OutboxAction>()?,
        record,
        final_error: row.get(6).map_err(map_sqlite_error)?,
        final_category: row.get(7).map_err(map_sqlite_error)?,
        history,
        dead_at: row.get(9).map_err(map_sqlite_error)?,
    })
}
