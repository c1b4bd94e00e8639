//! AES-256-GCM encryption with optional password-based key derivation.
//!
//! This module provides the low-level primitives the E2EE layer builds on:
//!
//! - [`EncryptionService`]: AES-256-GCM encryption/decryption with
//!   associated data support
//! - [`EncryptedData`]: serializable encrypted payload container
//! - Password-based key derivation using Argon2 (for key wrapping)
//!
//! Key management (per-project DEK lifecycle, wrapping, rotation) lives
//! above this module; the service only ever sees raw 32-byte keys.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::SaltString;
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

/// Encrypted payload container.
///
/// `salt` is present only for password-derived keys so the same key can be
/// re-derived for decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub algorithm: String,
}

const ALGORITHM: &str = "AES-256-GCM";

/// AES-GCM encryption service with optional password-based key derivation.
pub struct EncryptionService {
    key: Vec<u8>,
    cipher: Aes256Gcm,
    password_salt: Option<String>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key", &"[REDACTED]")
            .field("password_salt", &self.password_salt.is_some())
            .finish()
    }
}

impl EncryptionService {
    /// Create a new encryption service from a raw 32-byte key.
    pub fn new(key: Vec<u8>) -> CommonResult<Self> {
        if key.len() != 32 {
            return Err(CommonError::crypto("encryption key must be exactly 32 bytes"));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CommonError::crypto(format!("failed to create cipher: {e}")))?;

        Ok(Self { key, cipher, password_salt: None })
    }

    /// Derive an encryption key from a password using Argon2 with a fresh
    /// salt.
    pub fn from_password(password: &str) -> CommonResult<Self> {
        Self::from_password_with_salt(password, None)
    }

    /// Derive an encryption key from a password and optional existing salt.
    pub fn from_password_with_salt(password: &str, salt: Option<&str>) -> CommonResult<Self> {
        let salt = match salt {
            Some(existing) => SaltString::from_b64(existing)
                .map_err(|e| CommonError::crypto(format!("invalid password salt: {e}")))?,
            None => SaltString::generate(OsRng),
        };
        let argon2 = Argon2::default();

        let mut key = vec![0u8; 32];
        argon2
            .hash_password_into(password.as_bytes(), salt.as_str().as_bytes(), &mut key)
            .map_err(|e| CommonError::crypto(format!("key derivation failed: {e}")))?;

        let mut service = Self::new(key)?;
        service.password_salt = Some(salt.to_string());
        Ok(service)
    }

    /// Generate a random 32-byte symmetric key.
    pub fn generate_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Encrypt bytes into an [`EncryptedData`] payload.
    pub fn encrypt(&self, data: &[u8]) -> CommonResult<EncryptedData> {
        self.encrypt_with_aad(data, &[])
    }

    /// Encrypt bytes, binding the ciphertext to associated data.
    ///
    /// Decryption fails unless the exact same associated data is supplied,
    /// which prevents a ciphertext from being transplanted onto another row.
    pub fn encrypt_with_aad(&self, data: &[u8], aad: &[u8]) -> CommonResult<EncryptedData> {
        let nonce_bytes = Self::generate_nonce();
        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce_bytes), Payload { msg: data, aad })
            .map_err(|e| CommonError::crypto(format!("encryption failed: {e}")))?;

        Ok(EncryptedData {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
            salt: self.password_salt.clone(),
            algorithm: ALGORITHM.to_string(),
        })
    }

    /// Decrypt an [`EncryptedData`] payload back into raw bytes.
    pub fn decrypt(&self, encrypted: &EncryptedData) -> CommonResult<Vec<u8>> {
        self.decrypt_with_aad(encrypted, &[])
    }

    /// Decrypt a payload bound to associated data.
    pub fn decrypt_with_aad(&self, encrypted: &EncryptedData, aad: &[u8]) -> CommonResult<Vec<u8>> {
        if encrypted.algorithm != ALGORITHM {
            return Err(CommonError::crypto(format!(
                "unsupported algorithm: {}",
                encrypted.algorithm
            )));
        }

        let nonce_array: [u8; 12] = encrypted.nonce.as_slice().try_into().map_err(|_| {
            CommonError::crypto("nonce must be exactly 12 bytes for AES-256-GCM")
        })?;

        self.cipher
            .decrypt(&Nonce::from(nonce_array), Payload { msg: encrypted.ciphertext.as_ref(), aad })
            .map_err(|e| CommonError::crypto(format!("decryption failed: {e}")))
    }

    /// Encrypt a JSON value with associated data.
    pub fn encrypt_json(
        &self,
        value: &serde_json::Value,
        aad: &[u8],
    ) -> CommonResult<EncryptedData> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CommonError::internal(format!("content serialization failed: {e}")))?;
        self.encrypt_with_aad(&bytes, aad)
    }

    /// Decrypt a payload into a JSON value.
    pub fn decrypt_json(
        &self,
        encrypted: &EncryptedData,
        aad: &[u8],
    ) -> CommonResult<serde_json::Value> {
        let bytes = self.decrypt_with_aad(encrypted, aad)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CommonError::crypto(format!("decrypted content is not JSON: {e}")))
    }

    /// Encrypt bytes and encode the whole payload as a base64 string.
    pub fn encrypt_to_string(&self, data: &[u8]) -> CommonResult<String> {
        let encrypted = self.encrypt(data)?;
        let serialized = serde_json::to_vec(&encrypted)
            .map_err(|e| CommonError::internal(format!("payload serialization failed: {e}")))?;
        Ok(BASE64.encode(serialized))
    }

    /// Decode a base64 string and decrypt the contained payload.
    pub fn decrypt_from_string(&self, encrypted_str: &str) -> CommonResult<Vec<u8>> {
        let decoded = BASE64
            .decode(encrypted_str)
            .map_err(|e| CommonError::crypto(format!("base64 decode failed: {e}")))?;
        let encrypted: EncryptedData = serde_json::from_slice(&decoded)
            .map_err(|e| CommonError::crypto(format!("payload decode failed: {e}")))?;
        self.decrypt(&encrypted)
    }

    /// Salt of a password-derived key, if any.
    pub fn password_salt(&self) -> Option<&str> {
        self.password_salt.as_deref()
    }

    /// Generate a short fingerprint for the current key.
    pub fn key_fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        let result = hasher.finalize();
        BASE64.encode(&result[..8])
    }

    fn generate_nonce() -> [u8; 12] {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}
