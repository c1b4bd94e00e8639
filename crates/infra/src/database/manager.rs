//! SQLite connection manager shared by the repositories.
//!
//! Wraps an r2d2 pool over rusqlite, applies per-connection pragmas, and
//! owns the schema migrations. All repository work runs on blocking tasks
//! that borrow connections from this pool.

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use inkstone_domain::Result;
use tracing::{debug, info};

use crate::errors::{map_pool_error, map_sqlite_error};

/// A pooled SQLite connection.
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Pool + migrations for the engine database.
pub struct DbManager {
    pool: Pool<SqliteConnectionManager>,
}

impl DbManager {
    /// Open (or create) the database at `path` with `pool_size`
    /// connections.
    pub fn new(path: &Path, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder().max_size(pool_size).build(manager).map_err(map_pool_error)?;

        debug!(path = %path.display(), pool_size, "database pool created");
        Ok(Self { pool })
    }

    /// Borrow a connection from the pool.
    pub fn get_connection(&self) -> Result<DbConnection> {
        self.pool.get().map_err(map_pool_error)
    }

    /// Create or update the schema.
    pub fn run_migrations(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite_error)?;
        info!("database migrations applied");
        Ok(())
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS records (
    tbl          TEXT NOT NULL,
    id           TEXT NOT NULL,
    project_id   TEXT,
    updated_at   INTEGER NOT NULL,
    deleted_at   INTEGER,
    payload_json TEXT NOT NULL,
    client_rev   INTEGER,
    client_hash  TEXT,
    PRIMARY KEY (tbl, id)
);

CREATE INDEX IF NOT EXISTS idx_records_project
    ON records (tbl, project_id, updated_at);

CREATE TABLE IF NOT EXISTS sync_outbox (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    tbl                TEXT NOT NULL,
    record_id          TEXT NOT NULL,
    project_id         TEXT,
    action             TEXT NOT NULL,
    record_json        TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'pending',
    attempts           INTEGER NOT NULL DEFAULT 0,
    owner              TEXT,
    origin_dead_letter TEXT,
    next_attempt_at    INTEGER,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    history_json       TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_outbox_status
    ON sync_outbox (status, next_attempt_at);

CREATE INDEX IF NOT EXISTS idx_outbox_record_key
    ON sync_outbox (tbl, record_id, id);

CREATE TABLE IF NOT EXISTS sync_dead_letters (
    id             TEXT PRIMARY KEY,
    tbl            TEXT NOT NULL,
    record_id      TEXT NOT NULL,
    project_id     TEXT,
    action         TEXT NOT NULL,
    record_json    TEXT NOT NULL,
    final_error    TEXT NOT NULL,
    final_category TEXT NOT NULL,
    history_json   TEXT NOT NULL DEFAULT '[]',
    dead_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_dead_at
    ON sync_dead_letters (dead_at);

CREATE TABLE IF NOT EXISTS project_keys (
    project_id           TEXT PRIMARY KEY,
    wrapped_dek          TEXT NOT NULL,
    previous_wrapped_dek TEXT,
    created_at           INTEGER NOT NULL,
    rotated_at           INTEGER
);

CREATE TABLE IF NOT EXISTS engine_settings (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    settings_json TEXT NOT NULL
);
";

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn migrations_create_schema() {
        let dir = TempDir::new().expect("temp dir");
        let manager = DbManager::new(&dir.path().join("engine.db"), 2).expect("manager");
        manager.run_migrations().expect("migrations");

        let conn = manager.get_connection().expect("connection");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('records', 'sync_outbox', 'sync_dead_letters', 'project_keys', 'engine_settings')",
                [],
                |row| row.get(0),
            )
            .expect("schema query");
        assert_eq!(count, 5);
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let manager = DbManager::new(&dir.path().join("engine.db"), 2).expect("manager");
        manager.run_migrations().expect("first run");
        manager.run_migrations().expect("second run");
    }
}
