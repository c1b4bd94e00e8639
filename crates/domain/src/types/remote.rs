//! Remote row shapes and transport errors for the row store boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// E2EE payload substituted into a remote row when content is encrypted.
///
/// Both fields are base64. The AEAD associated data binds the ciphertext to
/// its `(table, id, project_id)` row so payloads cannot be transplanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContent {
    pub ciphertext: String,
    pub nonce: String,
}

/// One row as exchanged with the remote row store.
///
/// Structural columns are typed; everything table-specific travels in the
/// flattened `fields` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Fingerprint of the writing client, used to suppress realtime echoes
    /// of this device's own writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_rev: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<EncryptedContent>,
    /// Table-specific plaintext columns.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Authentication state reported by the row store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Authenticated { user_id: String },
    Anonymous,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }
}

/// Transport-level failure raised by the row store.
///
/// The error classifier's verdict is deterministic on the variant, the HTTP
/// status, and the presence of a `Retry-After` hint.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// `Retry-After` hint in milliseconds, when the server sent one.
        retry_after_ms: Option<u64>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("response decode error: {0}")]
    Decode(String),
}
