//! Hydration: pulling remote rows into the local store.
//!
//! Tables hydrate in a fixed order with `projects` first so child rows
//! always find their parent locally. Each row is decrypted when a DEK is
//! available (trying the previous key during a rotation window) and merged
//! by Last-Writer-Wins; a failure on one table is recorded and never
//! aborts the others.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use inkstone_common::crypto::EncryptedData;
use inkstone_core::{remote_wins, LocalStore, RowStore};
use inkstone_domain::{EngineError, Record, RecordTable, RemoteRow, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::e2ee::ProjectKeyManager;

/// What `hydrate_project` should pull.
#[derive(Debug, Clone)]
pub struct HydrationRequest {
    pub project_id: String,
    /// Restrict to these tables; `None` means every table. Iteration
    /// always follows the canonical order regardless of the order given
    /// here.
    pub tables: Option<Vec<RecordTable>>,
    /// Only rows with `updated_at > since` when present.
    pub since: Option<i64>,
}

impl HydrationRequest {
    pub fn full(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), tables: None, since: None }
    }

    pub fn table(project_id: impl Into<String>, table: RecordTable) -> Self {
        Self { project_id: project_id.into(), tables: Some(vec![table]), since: None }
    }
}

/// Per-table hydration outcome.
#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: RecordTable,
    pub fetched: usize,
    pub applied: usize,
    pub kept_local: usize,
    /// Encrypted rows skipped because no DEK was available.
    pub skipped_encrypted: usize,
    pub error: Option<String>,
}

/// Whole-project hydration outcome.
#[derive(Debug, Clone, Default)]
pub struct HydrationReport {
    pub tables: Vec<TableReport>,
}

impl HydrationReport {
    pub fn applied_total(&self) -> usize {
        self.tables.iter().map(|t| t.applied).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.tables.iter().any(|t| t.error.is_some())
    }
}

/// Where an initial project open should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapSource {
    /// Remote is newer (or local is absent); hydration ran.
    Remote,
    /// The local copy is current; nothing was pulled.
    Local,
    /// The project exists on neither side.
    None,
}

/// Progress callback invoked after each table completes.
pub type ProgressFn = dyn Fn(&TableReport) + Send + Sync;

/// Pulls remote state into the local store.
pub struct HydrationService {
    local: Arc<dyn LocalStore>,
    row_store: Arc<dyn RowStore>,
    keys: Arc<ProjectKeyManager>,
}

impl HydrationService {
    pub fn new(
        local: Arc<dyn LocalStore>,
        row_store: Arc<dyn RowStore>,
        keys: Arc<ProjectKeyManager>,
    ) -> Self {
        Self { local, row_store, keys }
    }

    /// Pull rows for a project and merge them locally.
    #[instrument(skip(self, request, progress), fields(project_id = %request.project_id))]
    pub async fn hydrate_project(
        &self,
        request: &HydrationRequest,
        progress: Option<&ProgressFn>,
    ) -> HydrationReport {
        let mut report = HydrationReport::default();

        for table in Self::tables_in_order(request.tables.as_deref()) {
            let table_report = self.hydrate_table(&request.project_id, table, request.since).await;
            if let Some(progress) = progress {
                progress(&table_report);
            }
            report.tables.push(table_report);
        }

        info!(
            applied = report.applied_total(),
            errors = report.has_errors(),
            "project hydration finished"
        );
        report
    }

    /// Decide where an initial project open should read from, hydrating
    /// when the remote copy is newer.
    #[instrument(skip(self))]
    pub async fn bootstrap_project(&self, project_id: &str) -> Result<BootstrapSource> {
        let local = self.local.get(RecordTable::Projects, project_id).await?;

        let remote = match self.row_store.fetch_project(project_id).await {
            Ok(remote) => remote,
            Err(err) => {
                // Unreachable remote: surface the local copy when there is
                // one, otherwise the open cannot proceed.
                return match local {
                    Some(_) => {
                        warn!(error = %err, "remote unavailable, opening local copy");
                        Ok(BootstrapSource::Local)
                    }
                    None => Err(EngineError::Network(err.to_string())),
                };
            }
        };

        match (local, remote) {
            (Some(local), Some(remote)) if remote.updated_at > local.updated_at => {
                self.hydrate_project(&HydrationRequest::full(project_id), None).await;
                Ok(BootstrapSource::Remote)
            }
            (Some(_), _) => Ok(BootstrapSource::Local),
            (None, Some(_)) => {
                self.hydrate_project(&HydrationRequest::full(project_id), None).await;
                Ok(BootstrapSource::Remote)
            }
            (None, None) => Ok(BootstrapSource::None),
        }
    }

    /// Canonical iteration order restricted to the requested subset.
    fn tables_in_order(requested: Option<&[RecordTable]>) -> Vec<RecordTable> {
        match requested {
            None => RecordTable::HYDRATION_ORDER.to_vec(),
            Some(subset) => RecordTable::HYDRATION_ORDER
                .into_iter()
                .filter(|table| subset.contains(table))
                .collect(),
        }
    }

    async fn hydrate_table(
        &self,
        project_id: &str,
        table: RecordTable,
        since: Option<i64>,
    ) -> TableReport {
        let mut report = TableReport {
            table,
            fetched: 0,
            applied: 0,
            kept_local: 0,
            skipped_encrypted: 0,
            error: None,
        };

        let rows = match self.row_store.fetch_rows(table, project_id, since).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(table = %table, error = %err, "table fetch failed");
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.fetched = rows.len();

        for row in rows {
            match self.apply_row(project_id, table, row, &mut report).await {
                Ok(()) => {}
                Err(err) => {
                    // Row-level failures are recorded but never abort the
                    // rest of the table.
                    warn!(table = %table, error = %err, "row apply failed");
                    report.error = Some(err.to_string());
                }
            }
        }

        debug!(
            table = %table,
            fetched = report.fetched,
            applied = report.applied,
            skipped = report.skipped_encrypted,
            "table hydrated"
        );
        report
    }

    async fn apply_row(
        &self,
        project_id: &str,
        table: RecordTable,
        row: RemoteRow,
        report: &mut TableReport,
    ) -> Result<()> {
        let payload = match self.decrypt_payload(project_id, table, &row) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                report.skipped_encrypted += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let record = Record {
            id: row.id.clone(),
            table,
            project_id: row.project_id.clone(),
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            payload: Value::Object(payload),
            client_rev: row.client_rev,
            client_hash: row.client_hash.clone(),
        };

        let local = self.local.get(table, &row.id).await?;
        if remote_wins(local.as_ref(), row.updated_at) {
            self.local.put(&record).await?;
            report.applied += 1;
        } else {
            report.kept_local += 1;
        }
        Ok(())
    }

    /// Rebuild the payload object for a row, decrypting secret content
    /// when present. Returns `Ok(None)` when the row is encrypted and no
    /// DEK is available.
    fn decrypt_payload(
        &self,
        project_id: &str,
        table: RecordTable,
        row: &RemoteRow,
    ) -> Result<Option<serde_json::Map<String, Value>>> {
        let Some(content) = &row.encrypted_content else {
            return Ok(Some(row.fields.clone()));
        };

        let services = self.keys.read_services(project_id);
        if services.is_empty() {
            debug!(row_id = %row.id, "encrypted row skipped, project not unlocked");
            return Ok(None);
        }

        let sealed = EncryptedData {
            nonce: BASE64
                .decode(&content.nonce)
                .map_err(|e| EngineError::Crypto(format!("nonce decode failed: {e}")))?,
            ciphertext: BASE64
                .decode(&content.ciphertext)
                .map_err(|e| EngineError::Crypto(format!("ciphertext decode failed: {e}")))?,
            salt: None,
            algorithm: "AES-256-GCM".to_string(),
        };
        let aad = format!("{}:{}:{}", table, row.id, project_id);

        // Try the current DEK first, then the previous one during a
        // rotation window.
        let mut last_error = None;
        for service in services {
            match service.decrypt_json(&sealed, aad.as_bytes()) {
                Ok(Value::Object(content_fields)) => {
                    let mut payload = row.fields.clone();
                    for (key, value) in content_fields {
                        payload.insert(key, value);
                    }
                    return Ok(Some(payload));
                }
                Ok(_) => {
                    return Err(EngineError::Crypto(format!(
                        "decrypted content for row {} is not an object",
                        row.id
                    )));
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(EngineError::Crypto(format!(
            "row {} failed to decrypt with any available key: {}",
            row.id,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
