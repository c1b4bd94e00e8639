//! Persistence policy: the user-selectable mode gating the sync stack.
//!
//! `local-only` keeps the outbox, hydration, realtime, and sync manager
//! inactive; `cloud-sync` and `hybrid` activate them. Switching modes runs
//! capability probes first and then the corresponding migration: moving
//! onto the cloud enqueues every live local record, moving off it pulls
//! the remote projects down.

use std::sync::Arc;

use inkstone_core::{LocalStore, OutboxQueue, RowStore};
use inkstone_core::SettingsStore;
use inkstone_domain::{
    AuthState, EngineError, NewOutboxEntry, PersistenceMode, PersistenceSettings, RecordTable,
    Result,
};
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::sync::hydration::{HydrationRequest, HydrationService};

/// Environment checks a mode switch validates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityProbes {
    pub storage_available: bool,
    pub cloud_reachable: bool,
    pub authenticated: bool,
}

/// What a mode-switch migration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Outbox entries enqueued by an export-to-cloud.
    pub exported_entries: usize,
    /// Projects hydrated by an import-from-cloud.
    pub imported_projects: usize,
}

/// Dependencies a mode-switch migration needs.
pub struct MigrationContext {
    pub local: Arc<dyn LocalStore>,
    pub outbox: Arc<dyn OutboxQueue>,
    pub row_store: Arc<dyn RowStore>,
    pub hydration: Arc<HydrationService>,
}

/// The engine's persistence settings, cached in memory and persisted
/// through the settings store.
pub struct PersistencePolicy {
    store: Arc<dyn SettingsStore>,
    cached: RwLock<PersistenceSettings>,
}

impl PersistencePolicy {
    /// Load settings (seeding defaults on first run).
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Self> {
        let settings = store.load().await?;
        Ok(Self { store, cached: RwLock::new(settings) })
    }

    pub fn mode(&self) -> PersistenceMode {
        self.cached.read().mode
    }

    pub fn settings(&self) -> PersistenceSettings {
        self.cached.read().clone()
    }

    /// Whether the outbox, hydration, realtime, and sync manager run.
    pub fn allows_sync(&self) -> bool {
        self.mode().sync_enabled()
    }

    /// Record a completed drain for observability.
    pub async fn touch_last_sync(&self, at: i64) -> Result<()> {
        let updated = {
            let mut cached = self.cached.write();
            cached.last_sync_at = Some(at);
            cached.clone()
        };
        self.store.save(&updated).await
    }

    /// Update non-mode settings (intervals, backup flags).
    pub async fn update_settings(&self, settings: PersistenceSettings) -> Result<()> {
        if settings.mode != self.mode() {
            return Err(EngineError::InvalidInput(
                "use switch_mode to change the persistence mode".into(),
            ));
        }
        self.store.save(&settings).await?;
        *self.cached.write() = settings;
        Ok(())
    }

    /// Probe the capabilities a mode switch depends on.
    pub async fn probe(&self, ctx: &MigrationContext) -> CapabilityProbes {
        let storage_available = self.store.load().await.is_ok();
        let (cloud_reachable, authenticated) = match ctx.row_store.auth_state().await {
            Ok(AuthState::Authenticated { .. }) => (true, true),
            Ok(AuthState::Anonymous) => (true, false),
            Err(err) => {
                warn!(error = %err, "cloud probe failed");
                (false, false)
            }
        };

        CapabilityProbes { storage_available, cloud_reachable, authenticated }
    }

    /// Switch persistence modes, running the migration the transition
    /// requires.
    #[instrument(skip(self, ctx))]
    pub async fn switch_mode(
        &self,
        new_mode: PersistenceMode,
        ctx: &MigrationContext,
    ) -> Result<MigrationOutcome> {
        let current = self.mode();
        if current == new_mode {
            return Ok(MigrationOutcome::default());
        }

        let probes = self.probe(ctx).await;
        if !probes.storage_available {
            return Err(EngineError::Storage("local storage is unavailable".into()));
        }
        if new_mode.sync_enabled() && !probes.cloud_reachable {
            return Err(EngineError::Network("cloud is unreachable".into()));
        }
        if new_mode.sync_enabled() && !probes.authenticated {
            return Err(EngineError::Auth("sign in before enabling cloud sync".into()));
        }

        let outcome = match (current.sync_enabled(), new_mode.sync_enabled()) {
            // Coming online: push everything we have.
            (false, true) => self.export_to_cloud(ctx).await?,
            // Going offline-only: make sure the local copy is complete.
            (true, false) => self.import_from_cloud(ctx).await?,
            _ => MigrationOutcome::default(),
        };

        let updated = {
            let mut cached = self.cached.write();
            cached.mode = new_mode;
            cached.clone()
        };
        self.store.save(&updated).await?;

        info!(from = %current, to = %new_mode, "persistence mode switched");
        Ok(outcome)
    }

    /// Enqueue every live local record, parents first.
    async fn export_to_cloud(&self, ctx: &MigrationContext) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();

        for project in ctx.local.list_projects().await? {
            let project_id = project.id.clone();
            ctx.outbox.enqueue(NewOutboxEntry::upsert(project)).await?;
            outcome.exported_entries += 1;

            for table in RecordTable::HYDRATION_ORDER {
                if table == RecordTable::Projects {
                    continue;
                }
                for record in ctx.local.list(table, &project_id).await? {
                    ctx.outbox.enqueue(NewOutboxEntry::upsert(record)).await?;
                    outcome.exported_entries += 1;
                }
            }
        }

        info!(entries = outcome.exported_entries, "export-to-cloud enqueued");
        Ok(outcome)
    }

    /// Hydrate every remote project into the local store.
    async fn import_from_cloud(&self, ctx: &MigrationContext) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();

        let projects = ctx
            .row_store
            .fetch_all_projects()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        for project in projects {
            let report = ctx
                .hydration
                .hydrate_project(&HydrationRequest::full(project.id.clone()), None)
                .await;
            if report.has_errors() {
                warn!(project_id = %project.id, "import finished with table errors");
            }
            outcome.imported_projects += 1;
        }

        info!(projects = outcome.imported_projects, "import-from-cloud finished");
        Ok(outcome)
    }
}
