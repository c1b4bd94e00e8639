//! SQLite persistence for engine settings.
//!
//! A single JSON row; the first load seeds defaults so callers never see
//! an empty settings table.

use std::sync::Arc;

use async_trait::async_trait;
use inkstone_core::SettingsStore;
use inkstone_domain::{PersistenceSettings, Result};
use rusqlite::ToSql;
use tokio::task;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_json_error, map_sqlite_error};

/// SQLite-backed settings store.
pub struct SqliteSettingsStore {
    db: Arc<DbManager>,
}

impl SqliteSettingsStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn load(&self) -> Result<PersistenceSettings> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> Result<PersistenceSettings> {
            let conn = db.get_connection()?;
            let mut stmt = conn
                .prepare("SELECT settings_json FROM engine_settings WHERE id = 1")
                .map_err(map_sqlite_error)?;
            let mut rows = stmt.query([]).map_err(map_sqlite_error)?;

            match rows.next().map_err(map_sqlite_error)? {
                Some(row) => {
                    let json: String = row.get(0).map_err(map_sqlite_error)?;
                    serde_json::from_str(&json)
                        .map_err(|e| map_json_error("settings decode failed", e))
                }
                None => Ok(PersistenceSettings::default()),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn save(&self, settings: &PersistenceSettings) -> Result<()> {
        let db = Arc::clone(&self.db);
        let settings = settings.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            let json = serde_json::to_string(&settings)
                .map_err(|e| map_json_error("settings serialization failed", e))?;
            conn.execute(
                "INSERT INTO engine_settings (id, settings_json) VALUES (1, ?1)
                 ON CONFLICT (id) DO UPDATE SET settings_json = excluded.settings_json",
                [&json as &dyn ToSql],
            )
            .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}
