//! Shared fixtures for the sync integration suites.
//!
//! `ScriptedRowStore` is an in-memory remote with scriptable failures so
//! scenarios can inject 401/429/500 responses deterministically;
//! `ChannelRealtimeTransport` delivers hand-crafted realtime events over
//! in-process channels.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use inkstone_core::{
    ChannelMessage, ChannelSubscription, RealtimeTransport, RowStore, SettingsStore,
};
use inkstone_domain::{
    AuthState, PersistenceMode, PersistenceSettings, Record, RecordTable, RemoteError, RemoteRow,
};
use inkstone_infra::database::{
    DbManager, SqliteDeadLetterStore, SqliteOutboxQueue, SqliteRecordStore, SqliteSettingsStore,
    SqliteWrappedKeyStore,
};
use inkstone_infra::e2ee::ProjectKeyManager;
use inkstone_infra::settings::PersistencePolicy;
use inkstone_infra::sync::{
    HydrationService, RecoveryConfig, RecoveryContext, SyncManager, SyncManagerConfig,
    UpsertEncoder,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// In-memory remote row store with scriptable failures.
pub struct ScriptedRowStore {
    rows: Mutex<HashMap<(RecordTable, String), RemoteRow>>,
    /// Failures popped one per upsert attempt.
    scripted_failures: Mutex<VecDeque<RemoteError>>,
    /// Every successful upsert in order: (table, row id, updated_at).
    upsert_log: Mutex<Vec<(RecordTable, String, i64)>>,
    fetch_count: Mutex<usize>,
    auth: Mutex<AuthState>,
}

impl ScriptedRowStore {
    fn with_auth(auth: AuthState) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            upsert_log: Mutex::new(Vec::new()),
            fetch_count: Mutex::new(0),
            auth: Mutex::new(auth),
        })
    }

    pub fn new_authenticated() -> Arc<Self> {
        Self::with_auth(AuthState::Authenticated { user_id: "writer-1".into() })
    }

    pub fn new_anonymous() -> Arc<Self> {
        Self::with_auth(AuthState::Anonymous)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        *self.auth.lock() = if authenticated {
            AuthState::Authenticated { user_id: "writer-1".into() }
        } else {
            AuthState::Anonymous
        };
    }

    /// Queue a failure for the next upsert attempt.
    pub fn fail_next(&self, error: RemoteError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn fail_next_n(&self, error: RemoteError, n: usize) {
        let mut failures = self.scripted_failures.lock();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Seed a remote row directly (simulating another device's write).
    pub fn seed_row(&self, table: RecordTable, row: RemoteRow) {
        self.rows.lock().insert((table, row.id.clone()), row);
    }

    pub fn row(&self, table: RecordTable, id: &str) -> Option<RemoteRow> {
        self.rows.lock().get(&(table, id.to_string())).cloned()
    }

    pub fn upsert_log(&self) -> Vec<(RecordTable, String, i64)> {
        self.upsert_log.lock().clone()
    }

    pub fn upsert_count(&self) -> usize {
        self.upsert_log.lock().len()
    }

    /// Number of `fetch_rows` calls served (used to observe debouncing).
    pub fn fetch_count(&self) -> usize {
        *self.fetch_count.lock()
    }
}

#[async_trait]
impl RowStore for ScriptedRowStore {
    async fn upsert_row(
        &self,
        table: RecordTable,
        row: &RemoteRow,
        _on_conflict: &str,
    ) -> Result<(), RemoteError> {
        if let Some(failure) = self.scripted_failures.lock().pop_front() {
            return Err(failure);
        }

        self.rows.lock().insert((table, row.id.clone()), row.clone());
        self.upsert_log.lock().push((table, row.id.clone(), row.updated_at));
        Ok(())
    }

    async fn fetch_rows(
        &self,
        table: RecordTable,
        project_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        *self.fetch_count.lock() += 1;
        let rows = self.rows.lock();
        let mut matched: Vec<RemoteRow> = rows
            .iter()
            .filter(|((row_table, _), row)| {
                if *row_table != table || row.deleted_at.is_some() {
                    return false;
                }
                let scope_matches = match table {
                    RecordTable::Projects => row.id == project_id,
                    _ => row.project_id.as_deref() == Some(project_id),
                };
                let since_matches = match since {
                    Some(since) => row.updated_at > since,
                    None => true,
                };
                scope_matches && since_matches
            })
            .map(|(_, row)| row.clone())
            .collect();
        matched.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(matched)
    }

    async fn fetch_project(&self, project_id: &str) -> Result<Option<RemoteRow>, RemoteError> {
        Ok(self.rows.lock().get(&(RecordTable::Projects, project_id.to_string())).cloned())
    }

    async fn fetch_all_projects(&self) -> Result<Vec<RemoteRow>, RemoteError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|((table, _), row)| *table == RecordTable::Projects && row.deleted_at.is_none())
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn auth_state(&self) -> Result<AuthState, RemoteError> {
        Ok(self.auth.lock().clone())
    }
}

/// Realtime transport delivering test-crafted events over channels.
#[derive(Default)]
pub struct ChannelRealtimeTransport {
    senders: Mutex<HashMap<(String, RecordTable), mpsc::Sender<ChannelMessage>>>,
}

impl ChannelRealtimeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a message onto an open channel.
    pub async fn emit(&self, project_id: &str, table: RecordTable, message: ChannelMessage) {
        let sender = self.senders.lock().get(&(project_id.to_string(), table)).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }

    pub fn channel_count(&self) -> usize {
        self.senders.lock().len()
    }
}

#[async_trait]
impl RealtimeTransport for ChannelRealtimeTransport {
    async fn subscribe(
        &self,
        project_id: &str,
        table: RecordTable,
    ) -> Result<ChannelSubscription, RemoteError> {
        let (sender, receiver) = mpsc::channel(64);
        // The channel reports itself live as soon as it opens.
        let _ = sender.try_send(ChannelMessage::Subscribed);
        self.senders.lock().insert((project_id.to_string(), table), sender);
        Ok(ChannelSubscription { receiver })
    }

    async fn unsubscribe(&self, project_id: &str, table: RecordTable) -> Result<(), RemoteError> {
        self.senders.lock().remove(&(project_id.to_string(), table));
        Ok(())
    }
}

/// A fully wired engine over a temp-dir database and the scripted remote.
pub struct TestEngine {
    pub db: Arc<DbManager>,
    pub local: Arc<SqliteRecordStore>,
    pub outbox: Arc<SqliteOutboxQueue>,
    pub dlq: Arc<SqliteDeadLetterStore>,
    pub keys: Arc<ProjectKeyManager>,
    pub policy: Arc<PersistencePolicy>,
    pub row_store: Arc<ScriptedRowStore>,
    pub encoder: Arc<UpsertEncoder>,
    pub hydration: Arc<HydrationService>,
    pub recovery: Arc<RecoveryContext>,
    pub manager: SyncManager,
    _dir: TempDir,
}

/// Build an engine in `cloud-sync` mode against an authenticated remote.
pub async fn build_engine() -> TestEngine {
    build_engine_with(ScriptedRowStore::new_authenticated(), test_recovery_config()).await
}

/// Recovery tuning small enough for test-scale timing.
pub fn test_recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        failure_threshold: 3,
        success_threshold: 2,
        open_timeout: std::time::Duration::from_millis(1_000),
        budget_limit: 100,
        budget_window: std::time::Duration::from_secs(60),
        ..RecoveryConfig::default()
    }
}

pub async fn build_engine_with(
    row_store: Arc<ScriptedRowStore>,
    recovery_config: RecoveryConfig,
) -> TestEngine {
    let dir = TempDir::new().expect("temp dir");
    let db = Arc::new(DbManager::new(&dir.path().join("engine.db"), 4).expect("db manager"));
    db.run_migrations().expect("migrations");

    let local = Arc::new(SqliteRecordStore::new(Arc::clone(&db)));
    let outbox = Arc::new(SqliteOutboxQueue::new(Arc::clone(&db)));
    let dlq = Arc::new(SqliteDeadLetterStore::new(Arc::clone(&db)));
    let keys = Arc::new(ProjectKeyManager::new(Arc::new(SqliteWrappedKeyStore::new(
        Arc::clone(&db),
    ))));

    let settings_store = Arc::new(SqliteSettingsStore::new(Arc::clone(&db)));
    let mut settings = PersistenceSettings::default();
    settings.mode = PersistenceMode::CloudSync;
    settings_store.save(&settings).await.expect("settings saved");
    let policy = Arc::new(
        PersistencePolicy::load(Arc::clone(&settings_store) as Arc<dyn SettingsStore>)
            .await
            .expect("policy"),
    );

    let encoder = Arc::new(UpsertEncoder::new(
        Arc::clone(&row_store) as Arc<dyn RowStore>,
        Arc::clone(&keys),
        "device-a",
    ));
    let hydration = Arc::new(HydrationService::new(
        Arc::clone(&local) as Arc<dyn inkstone_core::LocalStore>,
        Arc::clone(&row_store) as Arc<dyn RowStore>,
        Arc::clone(&keys),
    ));
    let recovery = Arc::new(
        RecoveryContext::new(
            recovery_config,
            Arc::clone(&dlq) as Arc<dyn inkstone_core::DeadLetterStore>,
        )
        .expect("recovery context"),
    );

    let manager = SyncManager::new(
        Arc::clone(&outbox) as Arc<dyn inkstone_core::OutboxQueue>,
        Arc::clone(&encoder),
        Arc::clone(&row_store) as Arc<dyn RowStore>,
        Arc::clone(&policy),
        Arc::clone(&recovery),
        SyncManagerConfig::default(),
    );

    TestEngine {
        db,
        local,
        outbox,
        dlq,
        keys,
        policy,
        row_store,
        encoder,
        hydration,
        recovery,
        manager,
        _dir: dir,
    }
}

/// Millisecond wall clock, matching the engine's timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn project_record(id: &str, updated_at: i64) -> Record {
    Record {
        id: id.into(),
        table: RecordTable::Projects,
        project_id: None,
        updated_at,
        deleted_at: None,
        payload: json!({"title": "Tide and Stone", "description": "a novel"}),
        client_rev: None,
        client_hash: None,
    }
}

pub fn chapter_record(id: &str, project_id: &str, body: &str, updated_at: i64) -> Record {
    Record {
        id: id.into(),
        table: RecordTable::Chapters,
        project_id: Some(project_id.into()),
        updated_at,
        deleted_at: None,
        payload: json!({"title": "Chapter", "body": body, "word_count": body.len()}),
        client_rev: None,
        client_hash: None,
    }
}

pub fn remote_chapter_row(
    id: &str,
    project_id: &str,
    body: &str,
    updated_at: i64,
    client_id: &str,
) -> RemoteRow {
    RemoteRow {
        id: id.into(),
        project_id: Some(project_id.into()),
        updated_at,
        deleted_at: None,
        client_id: Some(client_id.into()),
        client_rev: None,
        client_hash: None,
        encrypted_content: None,
        fields: json!({"title": "Chapter", "body": body})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    }
}
