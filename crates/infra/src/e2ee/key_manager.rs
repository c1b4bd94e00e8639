//! Per-project data-encryption-key lifecycle.
//!
//! Each E2EE-enabled project owns a random 32-byte DEK, wrapped at rest
//! under a KEK derived from the user's passphrase with Argon2. The
//! unwrapped DEK and the derived KEK exist only in this manager's memory
//! while the project is unlocked; the passphrase itself is never retained
//! or logged. During a rotation window reads must try both the current and
//! the previous DEK, so both stay cached until the next lock.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use inkstone_common::crypto::{EncryptedData, EncryptionService};
use inkstone_core::{WrappedKeyStore, WrappedProjectKey};
use inkstone_domain::{EngineError, Result};
use parking_lot::RwLock;
use tracing::{debug, info, instrument};

struct UnlockedProject {
    current: Arc<EncryptionService>,
    previous: Option<Arc<EncryptionService>>,
    /// Passphrase-derived wrapping key, retained while unlocked so
    /// rotation can wrap a fresh DEK without re-prompting.
    kek: EncryptionService,
}

/// Manages per-project DEKs and their wrapped persistence.
pub struct ProjectKeyManager {
    store: Arc<dyn WrappedKeyStore>,
    unlocked: RwLock<HashMap<String, UnlockedProject>>,
}

impl ProjectKeyManager {
    pub fn new(store: Arc<dyn WrappedKeyStore>) -> Self {
        Self { store, unlocked: RwLock::new(HashMap::new()) }
    }

    /// Enable E2EE for a project: generate a DEK, wrap it under the
    /// passphrase, persist the wrapped key, and leave the project unlocked.
    #[instrument(skip(self, passphrase))]
    pub async fn enable(&self, project_id: &str, passphrase: &str) -> Result<()> {
        if self.store.load(project_id).await?.is_some() {
            return Err(EngineError::InvalidInput(format!(
                "encryption already enabled for project {project_id}"
            )));
        }

        let kek = EncryptionService::from_password(passphrase)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        let dek = EncryptionService::generate_key();
        let wrapped = kek
            .encrypt_to_string(&dek)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        self.store
            .store(&WrappedProjectKey {
                project_id: project_id.to_owned(),
                wrapped_dek: wrapped,
                previous_wrapped_dek: None,
                created_at: Utc::now().timestamp_millis(),
                rotated_at: None,
            })
            .await?;

        let current = Arc::new(
            EncryptionService::new(dek).map_err(|e| EngineError::Crypto(e.to_string()))?,
        );
        self.unlocked.write().insert(
            project_id.to_owned(),
            UnlockedProject { current, previous: None, kek },
        );

        info!(project_id, "project encryption enabled");
        Ok(())
    }

    /// Unwrap the project's DEK into memory.
    #[instrument(skip(self, passphrase))]
    pub async fn unlock(&self, project_id: &str, passphrase: &str) -> Result<()> {
        let wrapped = self.store.load(project_id).await?.ok_or_else(|| {
            EngineError::NotFound(format!("encryption not enabled for project {project_id}"))
        })?;

        let (current_dek, kek) = unwrap_dek(passphrase, &wrapped.wrapped_dek)?;
        let current = Arc::new(
            EncryptionService::new(current_dek)
                .map_err(|e| EngineError::Crypto(e.to_string()))?,
        );

        let previous = match &wrapped.previous_wrapped_dek {
            Some(previous_wrapped) => {
                let (previous_dek, _) = unwrap_dek(passphrase, previous_wrapped)?;
                Some(Arc::new(
                    EncryptionService::new(previous_dek)
                        .map_err(|e| EngineError::Crypto(e.to_string()))?,
                ))
            }
            None => None,
        };

        self.unlocked.write().insert(
            project_id.to_owned(),
            UnlockedProject { current, previous, kek },
        );

        info!(project_id, "project unlocked");
        Ok(())
    }

    /// Drop the in-memory DEK for a project.
    pub fn lock(&self, project_id: &str) {
        if self.unlocked.write().remove(project_id).is_some() {
            info!(project_id, "project locked");
        }
    }

    /// Whether E2EE has been enabled for the project (wrapped key exists).
    pub async fn is_enabled(&self, project_id: &str) -> Result<bool> {
        if self.unlocked.read().contains_key(project_id) {
            return Ok(true);
        }
        Ok(self.store.load(project_id).await?.is_some())
    }

    /// Whether the project's DEK is currently in memory.
    pub fn is_unlocked(&self, project_id: &str) -> bool {
        self.unlocked.read().contains_key(project_id)
    }

    /// Encryption service over the current DEK, when unlocked.
    pub fn current_service(&self, project_id: &str) -> Option<Arc<EncryptionService>> {
        self.unlocked.read().get(project_id).map(|p| Arc::clone(&p.current))
    }

    /// Services to try when decrypting: current first, then the previous
    /// DEK while a rotation window is open.
    pub fn read_services(&self, project_id: &str) -> Vec<Arc<EncryptionService>> {
        match self.unlocked.read().get(project_id) {
            Some(project) => {
                let mut services = vec![Arc::clone(&project.current)];
                if let Some(previous) = &project.previous {
                    services.push(Arc::clone(previous));
                }
                services
            }
            None => Vec::new(),
        }
    }

    /// Issue a fresh DEK for the project. Requires the project to be
    /// unlocked; subsequent writes use the new key while reads keep trying
    /// the previous one.
    #[instrument(skip(self))]
    pub async fn rotate(&self, project_id: &str) -> Result<()> {
        let wrapped = self.store.load(project_id).await?.ok_or_else(|| {
            EngineError::NotFound(format!("encryption not enabled for project {project_id}"))
        })?;

        let new_dek = EncryptionService::generate_key();
        let (new_wrapped, new_current) = {
            let unlocked = self.unlocked.read();
            let project = unlocked.get(project_id).ok_or_else(|| {
                EngineError::Crypto(format!("project {project_id} is locked, unlock before rotate"))
            })?;
            let new_wrapped = project
                .kek
                .encrypt_to_string(&new_dek)
                .map_err(|e| EngineError::Crypto(e.to_string()))?;
            let new_current = Arc::new(
                EncryptionService::new(new_dek)
                    .map_err(|e| EngineError::Crypto(e.to_string()))?,
            );
            (new_wrapped, new_current)
        };

        self.store
            .store(&WrappedProjectKey {
                project_id: project_id.to_owned(),
                wrapped_dek: new_wrapped,
                previous_wrapped_dek: Some(wrapped.wrapped_dek),
                created_at: wrapped.created_at,
                rotated_at: Some(Utc::now().timestamp_millis()),
            })
            .await?;

        let mut unlocked = self.unlocked.write();
        if let Some(project) = unlocked.get_mut(project_id) {
            project.previous = Some(Arc::clone(&project.current));
            project.current = new_current;
        }

        debug!(project_id, "project key rotated");
        Ok(())
    }
}

/// Decode a wrapped DEK string and unwrap it with a KEK derived from the
/// passphrase and the salt embedded in the payload.
fn unwrap_dek(passphrase: &str, wrapped: &str) -> Result<(Vec<u8>, EncryptionService)> {
    let decoded = BASE64
        .decode(wrapped)
        .map_err(|e| EngineError::Crypto(format!("wrapped key decode failed: {e}")))?;
    let encrypted: EncryptedData = serde_json::from_slice(&decoded)
        .map_err(|e| EngineError::Crypto(format!("wrapped key payload invalid: {e}")))?;
    let salt = encrypted
        .salt
        .clone()
        .ok_or_else(|| EngineError::Crypto("wrapped key is missing its salt".into()))?;

    let kek = EncryptionService::from_password_with_salt(passphrase, Some(&salt))
        .map_err(|e| EngineError::Crypto(e.to_string()))?;
    let dek = kek
        .decrypt(&encrypted)
        .map_err(|_| EngineError::Crypto("invalid passphrase".into()))?;

    Ok((dek, kek))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryKeyStore {
        keys: Mutex<HashMap<String, WrappedProjectKey>>,
    }

    #[async_trait]
    impl WrappedKeyStore for MemoryKeyStore {
        async fn load(&self, project_id: &str) -> Result<Option<WrappedProjectKey>> {
            Ok(self.keys.lock().get(project_id).cloned())
        }

        async fn store(&self, key: &WrappedProjectKey) -> Result<()> {
            self.keys.lock().insert(key.project_id.clone(), key.clone());
            Ok(())
        }

        async fn remove(&self, project_id: &str) -> Result<()> {
            self.keys.lock().remove(project_id);
            Ok(())
        }
    }

    fn manager() -> ProjectKeyManager {
        ProjectKeyManager::new(Arc::new(MemoryKeyStore::default()))
    }

    #[tokio::test]
    async fn enable_unlocks_the_project() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");

        assert!(manager.is_enabled("p1").await.expect("enabled"));
        assert!(manager.is_unlocked("p1"));
        assert!(manager.current_service("p1").is_some());
    }

    #[tokio::test]
    async fn enable_twice_is_rejected() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");

        let result = manager.enable("p1", "other").await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn lock_drops_the_dek() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");

        manager.lock("p1");

        assert!(!manager.is_unlocked("p1"));
        assert!(manager.current_service("p1").is_none());
        assert!(manager.is_enabled("p1").await.expect("enabled"), "still enabled at rest");
    }

    #[tokio::test]
    async fn unlock_restores_the_same_key() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");

        let sealed = manager
            .current_service("p1")
            .expect("service")
            .encrypt(b"draft text")
            .expect("encrypt");

        manager.lock("p1");
        manager.unlock("p1", "passphrase").await.expect("unlock");

        let plaintext = manager
            .current_service("p1")
            .expect("service")
            .decrypt(&sealed)
            .expect("decrypt");
        assert_eq!(plaintext, b"draft text");
    }

    #[tokio::test]
    async fn unlock_with_wrong_passphrase_fails() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");
        manager.lock("p1");

        let result = manager.unlock("p1", "wrong").await;
        assert!(matches!(result, Err(EngineError::Crypto(_))));
        assert!(!manager.is_unlocked("p1"));
    }

    #[tokio::test]
    async fn unlock_unknown_project_fails() {
        let manager = manager();
        let result = manager.unlock("ghost", "passphrase").await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn rotate_keeps_previous_key_readable() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");

        let sealed_old = manager
            .current_service("p1")
            .expect("service")
            .encrypt(b"pre-rotation")
            .expect("encrypt");

        manager.rotate("p1").await.expect("rotate");

        // New writes use the new key; the old ciphertext still opens via
        // the read set.
        let services = manager.read_services("p1");
        assert_eq!(services.len(), 2);
        assert!(services[0].decrypt(&sealed_old).is_err(), "current key changed");
        assert_eq!(services[1].decrypt(&sealed_old).expect("previous decrypts"), b"pre-rotation");
    }

    #[tokio::test]
    async fn rotation_survives_relock() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");
        let sealed_old = manager
            .current_service("p1")
            .expect("service")
            .encrypt(b"pre-rotation")
            .expect("encrypt");

        manager.rotate("p1").await.expect("rotate");
        manager.lock("p1");
        manager.unlock("p1", "passphrase").await.expect("unlock");

        let services = manager.read_services("p1");
        assert_eq!(services.len(), 2, "previous key restored from wrapped storage");
        assert_eq!(services[1].decrypt(&sealed_old).expect("previous decrypts"), b"pre-rotation");
    }

    #[tokio::test]
    async fn rotate_requires_unlock() {
        let manager = manager();
        manager.enable("p1", "passphrase").await.expect("enable");
        manager.lock("p1");

        let result = manager.rotate("p1").await;
        assert!(matches!(result, Err(EngineError::Crypto(_))));
    }
}
