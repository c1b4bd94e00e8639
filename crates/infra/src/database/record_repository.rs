//! SQLite-backed implementation of the local store port.
//!
//! One `records` table keyed `(tbl, id)` holds every table's rows; the
//! payload is stored as JSON and stays opaque to the engine. Tombstones
//! are ordinary rows with `deleted_at` set and are never removed by sync.

use std::sync::Arc;

use async_trait::async_trait;
use inkstone_core::LocalStore;
use inkstone_domain::{EngineError, Record, RecordTable, Result};
use rusqlite::{Row, ToSql};
use tokio::task;
use tracing::debug;

use super::manager::{DbConnection, DbManager};
use crate::errors::{map_join_error, map_json_error, map_sqlite_error};

/// SQLite-backed record store.
pub struct SqliteRecordStore {
    db: Arc<DbManager>,
}

impl SqliteRecordStore {
    /// Construct a store backed by the shared connection manager.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn fetch_one(conn: &DbConnection, table: RecordTable, id: &str) -> Result<Option<Record>> {
        let mut stmt = conn.prepare(RECORD_SELECT_SQL).map_err(map_sqlite_error)?;
        let params: [&dyn ToSql; 2] = [&table.as_str(), &id];
        let mut rows = stmt.query(params.as_slice()).map_err(map_sqlite_error)?;

        match rows.next().map_err(map_sqlite_error)? {
            Some(row) => Ok(Some(map_record_row(row)?)),
            None => Ok(None),
        }
    }

    fn upsert(conn: &DbConnection, record: &Record) -> Result<()> {
        let payload_json = serde_json::to_string(&record.payload)
            .map_err(|e| map_json_error("record payload serialization failed", e))?;
        let params: [&dyn ToSql; 8] = [
            &record.table.as_str(),
            &record.id,
            &record.project_id,
            &record.updated_at,
            &record.deleted_at,
            &payload_json,
            &record.client_rev,
            &record.client_hash,
        ];

        conn.execute(RECORD_UPSERT_SQL, params.as_slice()).map_err(map_sqlite_error)?;
        Ok(())
    }

    fn write_tombstone(conn: &DbConnection, table: RecordTable, id: &str, at: i64) -> Result<()> {
        let params: [&dyn ToSql; 5] = [&at, &at, &table.as_str(), &id, &at];
        let updated =
            conn.execute(RECORD_TOMBSTONE_SQL, params.as_slice()).map_err(map_sqlite_error)?;

        if updated > 0 {
            return Ok(());
        }

        // Either the record is missing, or a newer local edit supersedes
        // this tombstone; only the former is an error.
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM records WHERE tbl = ?1 AND id = ?2",
                [&table.as_str() as &dyn ToSql, &id],
                |_| Ok(true),
            )
            .map_err(map_sqlite_error)
            .or_else(|err| match err {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            })?;

        if exists {
            debug!(table = %table, id, at, "stale tombstone lost to newer local edit");
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("record {table}/{id} not found")))
        }
    }

    fn query_records(
        conn: &DbConnection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
        let mut rows = stmt.query(params).map_err(map_sqlite_error)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            records.push(map_record_row(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl LocalStore for SqliteRecordStore {
    async fn get(&self, table: RecordTable, id: &str) -> Result<Option<Record>> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<Option<Record>> {
            let conn = db.get_connection()?;
            Self::fetch_one(&conn, table, &id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list(&self, table: RecordTable, project_id: &str) -> Result<Vec<Record>> {
        let db = Arc::clone(&self.db);
        let project_id = project_id.to_owned();

        task::spawn_blocking(move || -> Result<Vec<Record>> {
            let conn = db.get_connection()?;
            let params: [&dyn ToSql; 2] = [&table.as_str(), &project_id];
            Self::query_records(&conn, RECORD_LIST_SQL, params.as_slice())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_projects(&self) -> Result<Vec<Record>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<Vec<Record>> {
            let conn = db.get_connection()?;
            Self::query_records(&conn, RECORD_LIST_PROJECTS_SQL, &[])
        })
        .await
        .map_err(map_join_error)?
    }

    async fn list_since(
        &self,
        table: RecordTable,
        project_id: &str,
        since: i64,
    ) -> Result<Vec<Record>> {
        let db = Arc::clone(&self.db);
        let project_id = project_id.to_owned();

        task::spawn_blocking(move || -> Result<Vec<Record>> {
            let conn = db.get_connection()?;
            let params: [&dyn ToSql; 3] = [&table.as_str(), &project_id, &since];
            Self::query_records(&conn, RECORD_LIST_SINCE_SQL, params.as_slice())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn put(&self, record: &Record) -> Result<()> {
        let db = Arc::clone(&self.db);
        let record = record.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::upsert(&conn, &record)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete(&self, table: RecordTable, id: &str, at: i64) -> Result<()> {
        let db = Arc::clone(&self.db);
        let id = id.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            Self::write_tombstone(&conn, table, &id, at)
        })
        .await
        .map_err(map_join_error)?
    }
}

const RECORD_SELECT_SQL: &str = "SELECT
        tbl, id, project_id, updated_at, deleted_at, payload_json, client_rev, client_hash
    FROM records
    WHERE tbl = ?1 AND id = ?2";

const RECORD_UPSERT_SQL: &str = "INSERT INTO records (
        tbl, id, project_id, updated_at, deleted_at, payload_json, client_rev, client_hash
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT (tbl, id) DO UPDATE SET
        project_id = excluded.project_id,
        updated_at = excluded.updated_at,
        deleted_at = excluded.deleted_at,
        payload_json = excluded.payload_json,
        client_rev = excluded.client_rev,
        client_hash = excluded.client_hash";

/// Tombstones merge like any other write: the delete applies only when it
/// is at least as new as the stored record, so a stale or reordered delete
/// can never erase a more recent edit or roll `updated_at` backwards.
const RECORD_TOMBSTONE_SQL: &str = "UPDATE records
    SET deleted_at = ?1,
        updated_at = ?2
    WHERE tbl = ?3 AND id = ?4 AND updated_at <= ?5";

const RECORD_LIST_SQL: &str = "SELECT
        tbl, id, project_id, updated_at, deleted_at, payload_json, client_rev, client_hash
    FROM records
    WHERE tbl = ?1 AND project_id = ?2 AND deleted_at IS NULL
    ORDER BY updated_at ASC, id ASC";

const RECORD_LIST_PROJECTS_SQL: &str = "SELECT
        tbl, id, project_id, updated_at, deleted_at, payload_json, client_rev, client_hash
    FROM records
    WHERE tbl = 'projects' AND deleted_at IS NULL
    ORDER BY updated_at ASC, id ASC";

const RECORD_LIST_SINCE_SQL: &str = "SELECT
        tbl, id, project_id, updated_at, deleted_at, payload_json, client_rev, client_hash
    FROM records
    WHERE tbl = ?1 AND project_id = ?2 AND updated_at > ?3
    ORDER BY updated_at ASC, id ASC";

fn map_record_row(row: &Row<'_>) -> Result<Record> {
    let table_raw: String = row.get(0).map_err(map_sqlite_error)?;
    let table: RecordTable = table_raw.parse()?;
    let payload_json: String = row.get(5).map_err(map_sqlite_error)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| map_json_error("record payload decode failed", e))?;

    Ok(Record {
        id: row.get(1).map_err(map_sqlite_error)?,
        table,
        project_id: row.get(2).map_err(map_sqlite_error)?,
        updated_at: row.get(3).map_err(map_sqlite_error)?,
        deleted_at: row.get(4).map_err(map_sqlite_error)?,
        payload,
        client_rev: row.get(6).map_err(map_sqlite_error)?,
        client_hash: row.get(7).map_err(map_sqlite_error)?,
    })
}
