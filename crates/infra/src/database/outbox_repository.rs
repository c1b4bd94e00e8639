//! SQLite-backed implementation of the outbox queue port.
//!
//! The queue is append-only with monotonic rowids, FIFO within a
//! `(table, record_id)` key: an entry is never handed out while an earlier
//! entry for the same record is still pending, awaiting retry, or in
//! flight. This collapses rapid edits into sequential propagation and
//! keeps the remote from observing out-of-order payloads for one record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use inkstone_core::OutboxQueue;
use inkstone_domain::{
    AttemptRecord, EngineError, NewOutboxEntry, OutboxAction, OutboxEntry, OutboxStats,
    OutboxStatus, Record, Result,
};
use rusqlite::{Row, ToSql};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use super::manager::{DbConnection, DbManager};
use crate::errors::{map_join_error, map_json_error, map_sqlite_error};

/// SQLite-backed outbox queue.
pub struct SqliteOutboxQueue {
    db: Arc<DbManager>,
}

impl SqliteOutboxQueue {
    /// Construct a queue backed by the shared connection manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn insert_entry(conn: &DbConnection, entry: &NewOutboxEntry, now: i64) -> Result<i64> {
        let record_json = serialize_record(&entry.record)?;
        let params: [&dyn ToSql; 8] = [
            &entry.table.as_str(),
            &entry.record_id,
            &entry.project_id,
            &entry.action.to_string(),
            &record_json,
            &entry.origin_dead_letter,
            &now,
            &now,
        ];

        conn.execute(OUTBOX_INSERT_SQL, params.as_slice()).map_err(map_sqlite_error)?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_eligible(conn: &DbConnection, limit: usize, now: i64) -> Result<Vec<OutboxEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(OUTBOX_PEEK_SQL).map_err(map_sqlite_error)?;
        let params: [&dyn ToSql; 2] = [&now, &limit];
        let mut rows = stmt.query(params.as_slice()).map_err(map_sqlite_error)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            entries.push(map_outbox_row(row)?);
        }
        Ok(entries)
    }

    fn stamp_syncing(conn: &mut DbConnection, ids: &[i64], owner: &str, now: i64) -> Result<()> {
        let tx = conn.transaction().map_err(map_sqlite_error)?;
        for id in ids {
            let params: [&dyn ToSql; 4] = [&owner, &now, id, &OutboxStatus::Syncing.to_string()];
            let updated = tx
                .execute(
                    "UPDATE sync_outbox
                     SET status = ?4, owner = ?1, updated_at = ?2
                     WHERE id = ?3 AND status IN ('pending', 'failed')",
                    params.as_slice(),
                )
                .map_err(map_sqlite_error)?;
            if updated == 0 {
                warn!(entry_id = id, "outbox entry not claimable for syncing");
            }
        }
        tx.commit().map_err(map_sqlite_error)
    }

    fn remove_on_success(conn: &DbConnection, id: i64) -> Result<()> {
        let deleted = conn
            .execute("DELETE FROM sync_outbox WHERE id = ?1", [&id as &dyn ToSql])
            .map_err(map_sqlite_error)?;

        if deleted == 0 {
            Err(EngineError::NotFound(format!("outbox entry {id} not found")))
        } else {
            Ok(())
        }
    }

    fn register_failure(
        conn: &DbConnection,
        id: i64,
        attempt: &AttemptRecord,
        next_attempt_at: i64,
        now: i64,
    ) -> Result<()> {
        let history_json: String = conn
            .query_row(
                "SELECT history_json FROM sync_outbox WHERE id = ?1",
                [&id as &dyn ToSql],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;

        let mut history: Vec<AttemptRecord> = serde_json::from_str(&history_json)
            .map_err(|e| map_json_error("attempt history decode failed", e))?;
        history.push(attempt.clone());
        let history_json = serde_json::to_string(&history)
            .map_err(|e| map_json_error("attempt history serialization failed", e))?;

        let params: [&dyn ToSql; 5] = [
            &OutboxStatus::Failed.to_string(),
            &history_json,
            &next_attempt_at,
            &now,
            &id,
        ];
        let updated = conn
            .execute(
                "UPDATE sync_outbox
                 SET status = ?1,
                     attempts = attempts + 1,
                     history_json = ?2,
                     next_attempt_at = ?3,
                     owner = NULL,
                     updated_at = ?4
                 WHERE id = ?5",
                params.as_slice(),
            )
            .map_err(map_sqlite_error)?;

        if updated == 0 {
            Err(EngineError::NotFound(format!("outbox entry {id} not found")))
        } else {
            Ok(())
        }
    }

    fn move_to_dlq(
        conn: &mut DbConnection,
        id: i64,
        final_error: &str,
        final_category: &str,
        now: i64,
    ) -> Result<String> {
        let tx = conn.transaction().map_err(map_sqlite_error)?;

        let entry = {
            let mut stmt = tx.prepare(OUTBOX_SELECT_ONE_SQL).map_err(map_sqlite_error)?;
            let mut rows = stmt.query([&id as &dyn ToSql]).map_err(map_sqlite_error)?;
            match rows.next().map_err(map_sqlite_error)? {
                Some(row) => map_outbox_row(row)?,
                None => {
                    return Err(EngineError::NotFound(format!("outbox entry {id} not found")));
                }
            }
        };

        let dead_letter_id = Uuid::new_v4().to_string();
        let record_json = serialize_record(&entry.record)?;
        let history_json = serde_json::to_string(&entry.history)
            .map_err(|e| map_json_error("attempt history serialization failed", e))?;

        let params: [&dyn ToSql; 10] = [
            &dead_letter_id,
            &entry.table.as_str(),
            &entry.record_id,
            &entry.project_id,
            &entry.action.to_string(),
            &record_json,
            &final_error,
            &final_category,
            &history_json,
            &now,
        ];
        tx.execute(
            "INSERT INTO sync_dead_letters (
                 id, tbl, record_id, project_id, action, record_json,
                 final_error, final_category, history_json, dead_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params.as_slice(),
        )
        .map_err(map_sqlite_error)?;

        tx.execute("DELETE FROM sync_outbox WHERE id = ?1", [&id as &dyn ToSql])
            .map_err(map_sqlite_error)?;

        tx.commit().map_err(map_sqlite_error)?;
        debug!(entry_id = id, dead_letter_id = %dead_letter_id, "outbox entry dead-lettered");
        Ok(dead_letter_id)
    }

    fn reset_in_flight(conn: &DbConnection, now: i64) -> Result<usize> {
        let params: [&dyn ToSql; 1] = [&now];
        conn.execute(
            "UPDATE sync_outbox
             SET status = CASE WHEN attempts > 0 THEN 'failed' ELSE 'pending' END,
                 owner = NULL,
                 updated_at = ?1
             WHERE status = 'syncing'",
            params.as_slice(),
        )
        .map_err(map_sqlite_error)
    }

    fn count_by_status(conn: &DbConnection) -> Result<OutboxStats> {
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sync_outbox GROUP BY status")
            .map_err(map_sqlite_error)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_error)?;

        let mut stats = OutboxStats::default();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let status: String = row.get(0).map_err(map_sqlite_error)?;
            let count: i64 = row.get(1).map_err(map_sqlite_error)?;
            let count = usize::try_from(count).unwrap_or(0);
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => stats.pending = count,
                Ok(OutboxStatus::Syncing) => stats.syncing = count,
                Ok(OutboxStatus::Failed) => stats.failed = count,
                Ok(_) => {}
                Err(_) => warn!(status = %status, "unknown outbox status in drain stats"),
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl OutboxQueue for SqliteOutboxQueue {
    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<i64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<i64> {
            let conn = db.get_connection()?;
            Self::insert_entry(&conn, &entry, now_millis())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn peek(&self, limit: usize, now: i64) -> Result<Vec<OutboxEntry>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<OutboxEntry>> {
            let conn = db.get_connection()?;
            Self::fetch_eligible(&conn, limit, now)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_syncing(&self, ids: &[i64], owner: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let ids = ids.to_vec();
        let owner = owner.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.get_connection()?;
            Self::stamp_syncing(&mut conn, &ids, &owner, now_millis())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_success(&self, id: i64) -> Result<()> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::remove_on_success(&conn, id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_failed(
        &self,
        id: i64,
        attempt: AttemptRecord,
        next_attempt_at: i64,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::register_failure(&conn, id, &attempt, next_attempt_at, now_millis())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn send_to_dlq(&self, id: i64, final_error: &str, final_category: &str) -> Result<String> {
        let db = Arc::clone(&self.db);
        let final_error = final_error.to_owned();
        let final_category = final_category.to_owned();

        task::spawn_blocking(move || -> Result<String> {
            let mut conn = db.get_connection()?;
            Self::move_to_dlq(&mut conn, id, &final_error, &final_category, now_millis())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<usize> {
            let conn = db.get_connection()?;
            Self::reset_in_flight(&conn, now_millis())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn drain_stats(&self) -> Result<OutboxStats> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<OutboxStats> {
            let conn = db.get_connection()?;
            Self::count_by_status(&conn)
        })
        .await
        .map_err(map_join_error)?
    }
}

const OUTBOX_INSERT_SQL: &str = "INSERT INTO sync_outbox (
        tbl, record_id, project_id, action, record_json, origin_dead_letter,
        created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// Eligible entries: pending or awaiting retry, past their next-eligibility
/// time, with no earlier unresolved entry for the same record key.
const OUTBOX_PEEK_SQL: &str = "SELECT
        o.id, o.tbl, o.record_id, o.project_id, o.action, o.record_json, o.status,
        o.attempts, o.owner, o.origin_dead_letter, o.next_attempt_at, o.created_at,
        o.updated_at, o.history_json
    FROM sync_outbox o
    WHERE o.status IN ('pending', 'failed')
      AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= ?1)
      AND NOT EXISTS (
          SELECT 1 FROM sync_outbox p
          WHERE p.tbl = o.tbl
            AND p.record_id = o.record_id
            AND p.id < o.id
            AND p.status IN ('pending', 'failed', 'syncing')
      )
    ORDER BY o.id ASC
    LIMIT ?2";

const OUTBOX_SELECT_ONE_SQL: &str = "SELECT
        id, tbl, record_id, project_id, action, record_json, status,
        attempts, owner, origin_dead_letter, next_attempt_at, created_at,
        updated_at, history_json
    FROM sync_outbox
    WHERE id = ?1";

fn map_outbox_row(row: &Row<'_>) -> Result<OutboxEntry> {
    let id: i64 = row.get(0).map_err(map_sqlite_error)?;
    let table_raw: String = row.get(1).map_err(map_sqlite_error)?;
    let action_raw: String = row.get(4).map_err(map_sqlite_error)?;
    let record_json: String = row.get(5).map_err(map_sqlite_error)?;
    let status_raw: String = row.get(6).map_err(map_sqlite_error)?;
    let history_json: String = row.get(13).map_err(map_sqlite_error)?;

    let record: Record = serde_json::from_str(&record_json)
        .map_err(|e| map_json_error("outbox record decode failed", e))?;
    let history: Vec<AttemptRecord> = serde_json::from_str(&history_json)
        .map_err(|e| map_json_error("attempt history decode failed", e))?;

    let status = match status_raw.parse::<OutboxStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(entry_id = id, raw_status = %status_raw, error = %err,
                "invalid outbox status in storage, defaulting to pending");
            OutboxStatus::Pending
        }
    };

    Ok(OutboxEntry {
        id,
        table: table_raw.parse()?,
        record_id: row.get(2).map_err(map_sqlite_error)?,
        project_id: row.get(3).map_err(map_sqlite_error)?,
        action: action_raw.parse::<OutboxAction>()?,
        record,
        status,
        attempts: row.get(7).map_err(map_sqlite_error)?,
        owner: row.get(8).map_err(map_sqlite_error)?,
        origin_dead_letter: row.get(9).map_err(map_sqlite_error)?,
        next_attempt_at: row.get(10).map_err(map_sqlite_error)?,
        created_at: row.get(11).map_err(map_sqlite_error)?,
        updated_at: row.get(12).map_err(map_sqlite_error)?,
        history,
    })
}

fn serialize_record(record: &Record) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|e| map_json_error("outbox record serialization failed", e))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
