//! # Inkstone Common
//!
//! Reusable building blocks for the Inkstone sync engine:
//!
//! - [`time`]: clock abstraction with a deterministic mock for tests
//! - [`resilience`]: circuit breaker, backoff strategy, and retry budget
//! - [`crypto`]: AES-256-GCM encryption service with Argon2 key derivation
//!
//! Nothing in this crate knows about records, outboxes, or the row store;
//! it depends only on external crates.

pub mod crypto;
pub mod error;
pub mod resilience;
pub mod time;

pub use error::{CommonError, CommonResult};
