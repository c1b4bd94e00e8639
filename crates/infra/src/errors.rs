//! Error conversions at the adapter boundary.
//!
//! SQLite, pool, and task-join errors are mapped into
//! [`EngineError`](inkstone_domain::EngineError) here so repositories stay
//! free of ad-hoc string formatting.

use inkstone_domain::EngineError;
use rusqlite::ErrorCode;
use tokio::task::JoinError;

/// Map a SQLite error into the engine error vocabulary.
///
/// Disk-full conditions surface as `Quota` so callers can distinguish an
/// unusable store from a full one; missing rows surface as `NotFound`.
pub fn map_sqlite_error(err: rusqlite::Error) -> EngineError {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound("row not found".into()),
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::DiskFull => EngineError::Quota(
                message.clone().unwrap_or_else(|| "database is full".to_string()),
            ),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                EngineError::Storage(format!("database busy: {err}"))
            }
            _ => EngineError::Storage(err.to_string()),
        },
        _ => EngineError::Storage(err.to_string()),
    }
}

/// Map a connection pool error.
pub fn map_pool_error(err: r2d2::Error) -> EngineError {
    EngineError::Storage(format!("connection pool error: {err}"))
}

/// Map a blocking-task join failure.
pub fn map_join_error(err: JoinError) -> EngineError {
    if err.is_cancelled() {
        EngineError::Internal("blocking task cancelled".into())
    } else {
        EngineError::Internal(format!("blocking task panic: {err}"))
    }
}

/// Map a JSON (de)serialization failure in a storage column.
pub fn map_json_error(context: &str, err: serde_json::Error) -> EngineError {
    EngineError::Storage(format!("{context}: {err}"))
}
