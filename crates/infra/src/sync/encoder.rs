//! Upsert encoder: local records to remote rows.
//!
//! Each record becomes exactly one upsert keyed by its table's conflict
//! column; there is no multi-row RPC. When a project has E2EE enabled and
//! unlocked, the table's secret fields are encrypted into
//! `encrypted_content` with the ciphertext bound to `(table, id,
//! project_id)`; a locked project falls back to plaintext so writes keep
//! flowing, and the next write while unlocked re-encrypts.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use inkstone_core::{RowStore, SyncFailure};
use inkstone_domain::constants::ENCRYPTED_TITLE_PLACEHOLDER;
use inkstone_domain::{
    EncryptedContent, OutboxAction, OutboxEntry, Record, RecordTable, RemoteRow,
};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::e2ee::ProjectKeyManager;

/// Payload fields encrypted per table; everything else stays plain on the
/// row.
fn secret_fields(table: RecordTable) -> &'static [&'static str] {
    match table {
        RecordTable::Projects => &["title", "description", "synopsis"],
        RecordTable::ProjectSettings => &[],
        RecordTable::Chapters | RecordTable::Sections => &["title", "body", "summary", "notes"],
        RecordTable::Characters => &["name", "bio", "description", "notes"],
        RecordTable::Notes => &["title", "body", "content"],
    }
}

/// Result of pushing a batch of records.
#[derive(Debug, Default)]
pub struct EncodeBatchReport {
    /// Records upserted successfully.
    pub processed: usize,
    /// Records that failed; the row store was not called for shape errors.
    pub errors: Vec<(String, SyncFailure)>,
}

impl EncodeBatchReport {
    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

/// Encodes records into remote rows and issues per-record upserts.
pub struct UpsertEncoder {
    row_store: Arc<dyn RowStore>,
    keys: Arc<ProjectKeyManager>,
    /// Installation fingerprint stamped on every outgoing row so this
    /// client can suppress its own realtime echoes.
    client_id: String,
}

impl UpsertEncoder {
    pub fn new(
        row_store: Arc<dyn RowStore>,
        keys: Arc<ProjectKeyManager>,
        client_id: impl Into<String>,
    ) -> Self {
        Self { row_store, keys, client_id: client_id.into() }
    }

    /// The fingerprint stamped on outgoing rows.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Push one outbox entry to the row store.
    #[instrument(skip(self, entry), fields(table = %entry.table, record_id = %entry.record_id))]
    pub async fn push_entry(&self, entry: &OutboxEntry) -> Result<(), SyncFailure> {
        let mut record = entry.record.clone();
        if entry.action == OutboxAction::Delete && record.deleted_at.is_none() {
            // A delete entry snapshotted before the tombstone landed still
            // propagates as a deletion.
            record.deleted_at = Some(record.updated_at);
        }
        self.push_record(&record).await
    }

    /// Push one record to the row store as a single upsert.
    pub async fn push_record(&self, record: &Record) -> Result<(), SyncFailure> {
        let row = self.encode_row(record).await?;
        self.row_store
            .upsert_row(record.table, &row, record.table.conflict_column())
            .await
            .map_err(SyncFailure::from)?;
        debug!("record upserted");
        Ok(())
    }

    /// Push a set of records, one upsert each. Batch boundaries exist for
    /// reporting only; an empty input returns a zeroed report without
    /// touching the row store.
    pub async fn push_records(&self, records: &[Record]) -> EncodeBatchReport {
        let mut report = EncodeBatchReport::default();
        for record in records {
            match self.push_record(record).await {
                Ok(()) => report.processed += 1,
                Err(failure) => {
                    warn!(record_id = %record.id, error = %failure, "record push failed");
                    report.errors.push((record.id.clone(), failure));
                }
            }
        }
        report
    }

    /// Translate a record into its remote row shape, encrypting when the
    /// project's E2EE is ready.
    pub async fn encode_row(&self, record: &Record) -> Result<RemoteRow, SyncFailure> {
        if record.table.requires_project_id() && record.project_id.is_none() {
            return Err(SyncFailure::InvalidRecord(format!(
                "{} record {} is missing its project_id",
                record.table, record.id
            )));
        }

        let payload = record.payload.as_object().cloned().ok_or_else(|| {
            SyncFailure::InvalidRecord(format!(
                "{} record {} payload is not an object",
                record.table, record.id
            ))
        })?;

        let mut row = RemoteRow {
            id: record.id.clone(),
            project_id: record.project_id.clone(),
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            client_id: Some(self.client_id.clone()),
            client_rev: record.client_rev,
            client_hash: record.client_hash.clone(),
            encrypted_content: None,
            fields: Map::new(),
        };

        match self.encryption_service_for(record).await {
            Some(service) => {
                let (content, plain) = split_secret_fields(record.table, payload);
                if content.is_empty() {
                    row.fields = plain;
                    return Ok(row);
                }

                let aad = content_aad(record);
                let sealed = service
                    .encrypt_json(&Value::Object(content), aad.as_bytes())
                    .map_err(|e| SyncFailure::Crypto(e.to_string()))?;

                row.encrypted_content = Some(EncryptedContent {
                    ciphertext: BASE64.encode(&sealed.ciphertext),
                    nonce: BASE64.encode(&sealed.nonce),
                });
                row.fields = plain;
                row.fields.insert(
                    "title".to_string(),
                    Value::String(ENCRYPTED_TITLE_PLACEHOLDER.to_string()),
                );
                row.fields.insert("body".to_string(), Value::String(String::new()));
            }
            None => {
                row.fields = payload;
            }
        }

        Ok(row)
    }

    /// The encryption service to use for this record, or `None` for the
    /// plaintext path. A locked project and a failing enablement probe both
    /// fall back to plaintext; only an actual encryption attempt may fail
    /// the operation.
    async fn encryption_service_for(
        &self,
        record: &Record,
    ) -> Option<Arc<inkstone_common::crypto::EncryptionService>> {
        let project_id = record.scope_project_id()?;

        match self.keys.is_enabled(project_id).await {
            Ok(true) => match self.keys.current_service(project_id) {
                Some(service) => Some(service),
                None => {
                    debug!(project_id, "project locked, emitting plaintext row");
                    None
                }
            },
            Ok(false) => None,
            Err(err) => {
                warn!(project_id, error = %err, "encryption probe failed, emitting plaintext row");
                None
            }
        }
    }
}

/// Partition the payload into the table's secret content object and the
/// plain remainder.
fn split_secret_fields(
    table: RecordTable,
    payload: Map<String, Value>,
) -> (Map<String, Value>, Map<String, Value>) {
    let secrets = secret_fields(table);
    let mut content = Map::new();
    let mut plain = Map::new();

    for (key, value) in payload {
        if secrets.contains(&key.as_str()) {
            content.insert(key, value);
        } else {
            plain.insert(key, value);
        }
    }
    (content, plain)
}

/// Associated data binding ciphertext to its row.
pub(crate) fn content_aad(record: &Record) -> String {
    format!(
        "{}:{}:{}",
        record.table,
        record.id,
        record.scope_project_id().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use inkstone_core::{WrappedKeyStore, WrappedProjectKey};
    use inkstone_domain::{AuthState, RemoteError, Result as DomainResult};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct RecordingRowStore {
        upserts: Mutex<Vec<(RecordTable, RemoteRow, String)>>,
    }

    impl RecordingRowStore {
        fn upsert_count(&self) -> usize {
            self.upserts.lock().len()
        }

        fn last_row(&self) -> RemoteRow {
            self.upserts.lock().last().map(|(_, row, _)| row.clone()).expect("row recorded")
        }
    }

    #[async_trait]
    impl RowStore for RecordingRowStore {
        async fn upsert_row(
            &self,
            table: RecordTable,
            row: &RemoteRow,
            on_conflict: &str,
        ) -> Result<(), RemoteError> {
            self.upserts.lock().push((table, row.clone(), on_conflict.to_string()));
            Ok(())
        }

        async fn fetch_rows(
            &self,
            _table: RecordTable,
            _project_id: &str,
            _since: Option<i64>,
        ) -> Result<Vec<RemoteRow>, RemoteError> {
            Ok(Vec::new())
        }

        async fn fetch_project(&self, _project_id: &str) -> Result<Option<RemoteRow>, RemoteError> {
            Ok(None)
        }

        async fn fetch_all_projects(&self) -> Result<Vec<RemoteRow>, RemoteError> {
            Ok(Vec::new())
        }

        async fn auth_state(&self) -> Result<AuthState, RemoteError> {
            Ok(AuthState::Authenticated { user_id: "u1".into() })
        }
    }

    #[derive(Default)]
    struct MemoryKeyStore {
        keys: Mutex<HashMap<String, WrappedProjectKey>>,
    }

    #[async_trait]
    impl WrappedKeyStore for MemoryKeyStore {
        async fn load(&self, project_id: &str) -> DomainResult<Option<WrappedProjectKey>> {
            Ok(self.keys.lock().get(project_id).cloned())
        }

        async fn store(&self, key: &WrappedProjectKey) -> DomainResult<()> {
            self.keys.lock().insert(key.project_id.clone(), key.clone());
            Ok(())
        }

        async fn remove(&self, project_id: &str) -> DomainResult<()> {
            self.keys.lock().remove(project_id);
            Ok(())
        }
    }

    fn encoder() -> (UpsertEncoder, Arc<RecordingRowStore>, Arc<ProjectKeyManager>) {
        let row_store = Arc::new(RecordingRowStore::default());
        let keys = Arc::new(ProjectKeyManager::new(Arc::new(MemoryKeyStore::default())));
        let encoder =
            UpsertEncoder::new(Arc::clone(&row_store) as Arc<dyn RowStore>, Arc::clone(&keys), "device-a");
        (encoder, row_store, keys)
    }

    fn chapter(id: &str) -> Record {
        Record {
            id: id.into(),
            table: RecordTable::Chapters,
            project_id: Some("p1".into()),
            updated_at: 100,
            deleted_at: None,
            payload: json!({"title": "One", "body": "It began at sea.", "word_count": 4}),
            client_rev: None,
            client_hash: None,
        }
    }

    #[tokio::test]
    async fn plaintext_row_carries_payload_and_fingerprint() {
        let (encoder, rows, _keys) = encoder();

        encoder.push_record(&chapter("c1")).await.expect("push");

        let row = rows.last_row();
        assert_eq!(row.fields["title"], "One");
        assert_eq!(row.fields["word_count"], 4);
        assert_eq!(row.client_id.as_deref(), Some("device-a"));
        assert!(row.encrypted_content.is_none());
    }

    #[tokio::test]
    async fn project_settings_conflict_on_project_id() {
        let (encoder, rows, _keys) = encoder();
        let record = Record {
            id: "s1".into(),
            table: RecordTable::ProjectSettings,
            project_id: Some("p1".into()),
            updated_at: 100,
            deleted_at: None,
            payload: json!({"theme": "dark"}),
            client_rev: None,
            client_hash: None,
        };

        encoder.push_record(&record).await.expect("push");

        let (_, _, on_conflict) = rows.upserts.lock()[0].clone();
        assert_eq!(on_conflict, "project_id");
    }

    #[tokio::test]
    async fn missing_project_id_fails_without_calling_row_store() {
        let (encoder, rows, _keys) = encoder();
        let mut record = chapter("c1");
        record.project_id = None;

        let result = encoder.push_record(&record).await;

        assert!(matches!(result, Err(SyncFailure::InvalidRecord(_))));
        assert_eq!(rows.upsert_count(), 0, "row store must not be called");
    }

    #[tokio::test]
    async fn unlocked_project_encrypts_secret_fields() {
        let (encoder, rows, keys) = encoder();
        keys.enable("p1", "passphrase").await.expect("enable");

        encoder.push_record(&chapter("c1")).await.expect("push");

        let row = rows.last_row();
        let content = row.encrypted_content.expect("encrypted content");
        assert!(!content.ciphertext.is_empty());
        assert_eq!(row.fields["title"], ENCRYPTED_TITLE_PLACEHOLDER);
        assert_eq!(row.fields["body"], "");
        // Non-secret fields stay plain.
        assert_eq!(row.fields["word_count"], 4);

        // The ciphertext opens with the project DEK and the row's AAD.
        let service = keys.current_service("p1").expect("service");
        let sealed = inkstone_common::crypto::EncryptedData {
            nonce: BASE64.decode(&content.nonce).expect("nonce"),
            ciphertext: BASE64.decode(&content.ciphertext).expect("ciphertext"),
            salt: None,
            algorithm: "AES-256-GCM".into(),
        };
        let decrypted =
            service.decrypt_json(&sealed, b"chapters:c1:p1").expect("decrypts with aad");
        assert_eq!(decrypted["body"], "It began at sea.");
    }

    #[tokio::test]
    async fn locked_project_falls_back_to_plaintext() {
        let (encoder, rows, keys) = encoder();
        keys.enable("p1", "passphrase").await.expect("enable");
        keys.lock("p1");

        encoder.push_record(&chapter("c1")).await.expect("push succeeds while locked");

        let row = rows.last_row();
        assert!(row.encrypted_content.is_none());
        assert_eq!(row.fields["body"], "It began at sea.");
    }

    #[tokio::test]
    async fn delete_entry_propagates_tombstone() {
        let (encoder, rows, _keys) = encoder();
        let mut record = chapter("c1");
        record.deleted_at = None;

        let entry = OutboxEntry {
            id: 1,
            table: record.table,
            record_id: record.id.clone(),
            project_id: record.project_id.clone(),
            action: OutboxAction::Delete,
            record,
            status: inkstone_domain::OutboxStatus::Pending,
            attempts: 0,
            owner: None,
            origin_dead_letter: None,
            next_attempt_at: None,
            created_at: 0,
            updated_at: 0,
            history: Vec::new(),
        };

        encoder.push_entry(&entry).await.expect("push");

        let row = rows.last_row();
        assert_eq!(row.deleted_at, Some(100));
    }

    /// Boundary: empty input produces zero upserts; 120 inputs produce
    /// exactly 120 individual upserts.
    #[tokio::test]
    async fn batch_is_per_record_upserts() {
        let (encoder, rows, _keys) = encoder();

        let report = encoder.push_records(&[]).await;
        assert_eq!(report.processed, 0);
        assert_eq!(rows.upsert_count(), 0);

        let records: Vec<Record> = (0..120).map(|i| chapter(&format!("c{i}"))).collect();
        let report = encoder.push_records(&records).await;
        assert_eq!(report.processed, 120);
        assert_eq!(report.failed(), 0);
        assert_eq!(rows.upsert_count(), 120);
    }

    #[tokio::test]
    async fn batch_records_shape_errors_and_continues() {
        let (encoder, rows, _keys) = encoder();
        let mut orphan = chapter("orphan");
        orphan.project_id = None;

        let report = encoder.push_records(&[chapter("c1"), orphan, chapter("c2")]).await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.errors[0].0, "orphan");
        assert_eq!(rows.upsert_count(), 2);
    }
}
