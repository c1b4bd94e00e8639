//! # Inkstone Core
//!
//! Port interfaces and pure sync logic for the Inkstone engine:
//!
//! - [`sync::ports`]: traits implemented by the storage and transport
//!   adapters in `inkstone-infra`
//! - [`sync::classify`]: the error classifier, the single vocabulary for
//!   retry decisions
//! - [`sync::merge`]: Last-Writer-Wins conflict resolution
//! - [`sync::stats`]: process-wide recovery counters
//!
//! Nothing here performs I/O; services in `inkstone-infra` wire these
//! pieces to SQLite and the remote row store.

pub mod sync;

pub use sync::classify::{classify, ClassifiedError, ErrorCategory, SyncFailure};
pub use sync::merge::{remote_wins, MergeDecision};
pub use sync::ports::{
    ChangeEvent, ChannelMessage, ChannelSubscription, DeadLetterStore, LocalStore, OutboxQueue,
    RealtimeEventType, RealtimeTransport, RowStore, SettingsStore, WrappedKeyStore,
    WrappedProjectKey,
};
pub use sync::stats::{RecoveryStats, RecoveryStatsSnapshot};
