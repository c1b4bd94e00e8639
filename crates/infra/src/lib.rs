//! # Inkstone Infra
//!
//! Concrete adapters and services for the Inkstone sync engine:
//!
//! - [`database`]: SQLite repositories behind the core port traits
//! - [`remote`]: HTTP row-store client
//! - [`sync`]: upsert encoder, hydration service, realtime router, sync
//!   manager, and the shared recovery context
//! - [`e2ee`]: per-project data-encryption-key lifecycle
//! - [`settings`]: persistence policy gating the sync stack

pub mod database;
pub mod e2ee;
pub mod errors;
pub mod remote;
pub mod settings;
pub mod sync;
