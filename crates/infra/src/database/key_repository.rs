//! SQLite persistence for wrapped project keys.
//!
//! Only wrapped DEK material is stored here; unwrapped keys never touch
//! disk.

use std::sync::Arc;

use async_trait::async_trait;
use inkstone_core::{WrappedKeyStore, WrappedProjectKey};
use inkstone_domain::Result;
use rusqlite::ToSql;
use tokio::task;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_sqlite_error};

/// SQLite-backed wrapped-key store.
pub struct SqliteWrappedKeyStore {
    db: Arc<DbManager>,
}

impl SqliteWrappedKeyStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WrappedKeyStore for SqliteWrappedKeyStore {
    async fn load(&self, project_id: &str) -> Result<Option<WrappedProjectKey>> {
        let db = Arc::clone(&self.db);
        let project_id = project_id.to_owned();

        task::spawn_blocking(move || -> Result<Option<WrappedProjectKey>> {
            let conn = db.get_connection()?;
            let mut stmt = conn
                .prepare(
                    "SELECT project_id, wrapped_dek, previous_wrapped_dek, created_at, rotated_at
                     FROM project_keys WHERE project_id = ?1",
                )
                .map_err(map_sqlite_error)?;
            let mut rows = stmt.query([&project_id as &dyn ToSql]).map_err(map_sqlite_error)?;

            match rows.next().map_err(map_sqlite_error)? {
                Some(row) => Ok(Some(WrappedProjectKey {
                    project_id: row.get(0).map_err(map_sqlite_error)?,
                    wrapped_dek: row.get(1).map_err(map_sqlite_error)?,
                    previous_wrapped_dek: row.get(2).map_err(map_sqlite_error)?,
                    created_at: row.get(3).map_err(map_sqlite_error)?,
                    rotated_at: row.get(4).map_err(map_sqlite_error)?,
                })),
                None => Ok(None),
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn store(&self, key: &WrappedProjectKey) -> Result<()> {
        let db = Arc::clone(&self.db);
        let key = key.clone();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            let params: [&dyn ToSql; 5] = [
                &key.project_id,
                &key.wrapped_dek,
                &key.previous_wrapped_dek,
                &key.created_at,
                &key.rotated_at,
            ];
            conn.execute(
                "INSERT INTO project_keys (
                     project_id, wrapped_dek, previous_wrapped_dek, created_at, rotated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (project_id) DO UPDATE SET
                     wrapped_dek = excluded.wrapped_dek,
                     previous_wrapped_dek = excluded.previous_wrapped_dek,
                     rotated_at = excluded.rotated_at",
                params.as_slice(),
            )
            .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn remove(&self, project_id: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let project_id = project_id.to_owned();

        task::spawn_blocking(move || -> Result<()> {
            let conn = db.get_connection()?;
            conn.execute(
                "DELETE FROM project_keys WHERE project_id = ?1",
                [&project_id as &dyn ToSql],
            )
            .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn setup() -> (SqliteWrappedKeyStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let manager = Arc::new(DbManager::new(&dir.path().join("keys.db"), 2).expect("manager"));
        manager.run_migrations().expect("migrations");
        (SqliteWrappedKeyStore::new(manager), dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_and_load_round_trip() {
        let (store, _dir) = setup().await;

        let key = WrappedProjectKey {
            project_id: "p1".into(),
            wrapped_dek: "wrapped-current".into(),
            previous_wrapped_dek: None,
            created_at: 1_000,
            rotated_at: None,
        };
        store.store(&key).await.expect("store");

        let loaded = store.load("p1").await.expect("load").expect("present");
        assert_eq!(loaded, key);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_updates_rotation_fields() {
        let (store, _dir) = setup().await;

        let mut key = WrappedProjectKey {
            project_id: "p1".into(),
            wrapped_dek: "v1".into(),
            previous_wrapped_dek: None,
            created_at: 1_000,
            rotated_at: None,
        };
        store.store(&key).await.expect("store v1");

        key.previous_wrapped_dek = Some("v1".into());
        key.wrapped_dek = "v2".into();
        key.rotated_at = Some(2_000);
        store.store(&key).await.expect("store v2");

        let loaded = store.load("p1").await.expect("load").expect("present");
        assert_eq!(loaded.wrapped_dek, "v2");
        assert_eq!(loaded.previous_wrapped_dek.as_deref(), Some("v1"));
        assert_eq!(loaded.rotated_at, Some(2_000));
        assert_eq!(loaded.created_at, 1_000, "created_at is immutable");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_missing_returns_none() {
        let (store, _dir) = setup().await;
        assert!(store.load("ghost").await.expect("load").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_deletes_key() {
        let (store, _dir) = setup().await;
        let key = WrappedProjectKey {
            project_id: "p1".into(),
            wrapped_dek: "wrapped".into(),
            previous_wrapped_dek: None,
            created_at: 1_000,
            rotated_at: None,
        };
        store.store(&key).await.expect("store");

        store.remove("p1").await.expect("remove");
        assert!(store.load("p1").await.expect("load").is_none());
    }
}
