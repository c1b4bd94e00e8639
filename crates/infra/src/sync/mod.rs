//! Sync services: encoder, hydration, realtime router, sync manager, and
//! the shared recovery context.

pub mod encoder;
pub mod hydration;
pub mod manager;
pub mod realtime;
pub mod recovery;

pub use encoder::{EncodeBatchReport, UpsertEncoder};
pub use hydration::{
    BootstrapSource, HydrationReport, HydrationRequest, HydrationService, TableReport,
};
pub use manager::{DrainSummary, SyncManager, SyncManagerConfig};
pub use realtime::{ConnectionStatus, RealtimeRouter, RealtimeRouterConfig};
pub use recovery::{RecoveryConfig, RecoveryContext};
