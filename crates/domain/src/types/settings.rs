//! Persistence settings controlling how the engine stores and syncs data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SYNC_INTERVAL_MS;
use crate::errors::EngineError;

/// User-selectable persistence mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceMode {
    /// Local store is authoritative; the sync stack is inactive.
    LocalOnly,
    /// Sync stack active; the local store is a cache of the remote.
    CloudSync,
    /// Sync stack active but the local store remains primary; merges happen
    /// on open/reconcile plus periodic backup pushes.
    Hybrid,
}

impl PersistenceMode {
    /// Whether the outbox, hydration, realtime, and sync manager are active.
    pub fn sync_enabled(self) -> bool {
        !matches!(self, PersistenceMode::LocalOnly)
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistenceMode::LocalOnly => "local-only",
            PersistenceMode::CloudSync => "cloud-sync",
            PersistenceMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for PersistenceMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-only" => Ok(PersistenceMode::LocalOnly),
            "cloud-sync" => Ok(PersistenceMode::CloudSync),
            "hybrid" => Ok(PersistenceMode::Hybrid),
            other => Err(EngineError::InvalidInput(format!("unknown persistence mode: {other}"))),
        }
    }
}

/// Persisted engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub mode: PersistenceMode,
    pub sync_interval_ms: u64,
    pub backup_interval_ms: u64,
    pub cloud_backup_enabled: bool,
    pub last_sync_at: Option<i64>,
    pub last_backup_at: Option<i64>,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::LocalOnly,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            backup_interval_ms: 15 * 60 * 1_000,
            cloud_backup_enabled: false,
            last_sync_at: None,
            last_backup_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in
            [PersistenceMode::LocalOnly, PersistenceMode::CloudSync, PersistenceMode::Hybrid]
        {
            let parsed: PersistenceMode = mode.to_string().parse().expect("parses");
            assert_eq!(parsed, mode);
        }
    }

    #[test]
    fn local_only_disables_sync() {
        assert!(!PersistenceMode::LocalOnly.sync_enabled());
        assert!(PersistenceMode::CloudSync.sync_enabled());
        assert!(PersistenceMode::Hybrid.sync_enabled());
    }

    #[test]
    fn defaults_start_local_only() {
        let settings = PersistenceSettings::default();
        assert_eq!(settings.mode, PersistenceMode::LocalOnly);
        assert_eq!(settings.sync_interval_ms, DEFAULT_SYNC_INTERVAL_MS);
        assert!(settings.last_sync_at.is_none());
    }
}
