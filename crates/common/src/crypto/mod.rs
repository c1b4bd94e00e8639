//! Cryptographic primitives for end-to-end content encryption.

pub mod encryption;

pub use encryption::{EncryptedData, EncryptionService};
