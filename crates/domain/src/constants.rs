//! Domain constants shared across the engine

/// Default interval between sync manager drain ticks, in milliseconds.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;

/// Default debounce window for realtime change events, in milliseconds.
pub const DEFAULT_CHANGE_DEBOUNCE_MS: u64 = 500;

/// Default delay before a realtime channel reconnect attempt, in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

/// Maximum delivery attempts before an outbox entry is dead-lettered.
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// Default number of outbox entries peeked per drain tick.
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 25;

/// Dead letter retention period, in days.
pub const DLQ_RETENTION_DAYS: i64 = 7;

/// Maximum number of dead letters retained before oldest-first eviction.
pub const DLQ_MAX_ENTRIES: usize = 1_000;

/// Placeholder title written to remote rows whose content is encrypted.
pub const ENCRYPTED_TITLE_PLACEHOLDER: &str = "[Encrypted]";
