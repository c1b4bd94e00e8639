//! Domain data types for the sync engine

pub mod dlq;
pub mod outbox;
pub mod records;
pub mod remote;
pub mod settings;

pub use dlq::DeadLetter;
pub use outbox::{
    AttemptRecord, NewOutboxEntry, OutboxAction, OutboxEntry, OutboxStats, OutboxStatus,
};
pub use records::{Record, RecordTable};
pub use remote::{AuthState, EncryptedContent, RemoteError, RemoteRow};
pub use settings::{PersistenceMode, PersistenceSettings};
