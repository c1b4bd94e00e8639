//! # Inkstone Domain
//!
//! Business domain types and models for the Inkstone sync engine.
//!
//! This crate contains:
//! - Record and table types stored by the local store
//! - Outbox entry and dead-letter types used by the sync queue
//! - Remote row shapes exchanged with the row store
//! - Persistence settings and domain constants
//! - Domain error types and Result definitions
//!
//! ## Architecture
//! - No dependencies on other Inkstone crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod constants;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::*;
pub use types::*;
