//! Error classification for sync operations.
//!
//! The classifier is pure and side-effect free; its output is the sole
//! authority for retry decisions downstream. It never inspects record
//! payloads, only transport metadata.

use std::fmt;
use std::time::Duration;

use inkstone_domain::RemoteError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fallback `Retry-After` when a 429 arrives without the header.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_millis(60_000);

/// Categories of sync failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Authentication,
    ClientError,
    ServerError,
    Conflict,
    Unknown,
}

impl ErrorCategory {
    /// Every category, in a stable order (used to pre-initialize
    /// histograms).
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::RateLimit,
        ErrorCategory::Authentication,
        ErrorCategory::ClientError,
        ErrorCategory::ServerError,
        ErrorCategory::Conflict,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::ClientError => "CLIENT_ERROR",
            ErrorCategory::ServerError => "SERVER_ERROR",
            ErrorCategory::Conflict => "CONFLICT",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised anywhere on the push path.
#[derive(Debug, Clone, Error)]
pub enum SyncFailure {
    /// The row store rejected or never received the call.
    #[error(transparent)]
    Remote(RemoteError),

    /// The record cannot be encoded into a remote row (e.g. a child record
    /// without its required `project_id`). Retrying cannot help.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Content encryption was attempted and failed.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl From<RemoteError> for SyncFailure {
    fn from(err: RemoteError) -> Self {
        SyncFailure::Remote(err)
    }
}

/// Classifier verdict for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    /// Base delay the backoff strategy should grow from.
    pub suggested_delay: Option<Duration>,
    /// Server-mandated minimum wait, floored into the backoff result.
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ClassifiedError {
    fn retryable(category: ErrorCategory, delay: Duration, message: String) -> Self {
        Self {
            category,
            is_retryable: true,
            suggested_delay: Some(delay),
            retry_after: None,
            message,
        }
    }

    fn terminal(category: ErrorCategory, message: String) -> Self {
        Self { category, is_retryable: false, suggested_delay: None, retry_after: None, message }
    }
}

/// Map a sync failure into a category, retryability, and delay hints.
///
/// Deterministic on the failure variant, the HTTP status, and the presence
/// of a `Retry-After` hint.
pub fn classify(failure: &SyncFailure) -> ClassifiedError {
    match failure {
        SyncFailure::Remote(remote) => classify_remote(remote),
        SyncFailure::InvalidRecord(message) => {
            ClassifiedError::terminal(ErrorCategory::ClientError, message.clone())
        }
        // Encryption failures are treated as transient: the key manager may
        // be mid-unlock or mid-rotation on the next attempt.
        SyncFailure::Crypto(message) => ClassifiedError::retryable(
            ErrorCategory::Unknown,
            Duration::from_millis(3_000),
            message.clone(),
        ),
    }
}

fn classify_remote(remote: &RemoteError) -> ClassifiedError {
    match remote {
        RemoteError::Http { status, message, retry_after_ms } => {
            classify_http(*status, message, *retry_after_ms)
        }
        RemoteError::Network(message) => ClassifiedError::retryable(
            ErrorCategory::Network,
            Duration::from_millis(1_000),
            message.clone(),
        ),
        RemoteError::Timeout(duration) => ClassifiedError::retryable(
            ErrorCategory::Network,
            Duration::from_millis(1_000),
            format!("request timed out after {duration:?}"),
        ),
        RemoteError::Unauthenticated => {
            ClassifiedError::terminal(ErrorCategory::Authentication, "not authenticated".into())
        }
        RemoteError::Decode(message) => ClassifiedError::retryable(
            ErrorCategory::Unknown,
            Duration::from_millis(3_000),
            message.clone(),
        ),
    }
}

fn classify_http(status: u16, message: &str, retry_after_ms: Option<u64>) -> ClassifiedError {
    match status {
        429 => {
            let wait = retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
            ClassifiedError {
                category: ErrorCategory::RateLimit,
                is_retryable: true,
                suggested_delay: Some(wait),
                retry_after: Some(wait),
                message: message.to_string(),
            }
        }
        401 | 403 => ClassifiedError::terminal(ErrorCategory::Authentication, message.to_string()),
        400 | 404 | 422 => {
            ClassifiedError::terminal(ErrorCategory::ClientError, message.to_string())
        }
        409 => ClassifiedError::retryable(
            ErrorCategory::Conflict,
            Duration::from_millis(2_000),
            message.to_string(),
        ),
        500..=599 => ClassifiedError::retryable(
            ErrorCategory::ServerError,
            Duration::from_millis(5_000),
            message.to_string(),
        ),
        _ => ClassifiedError::retryable(
            ErrorCategory::Unknown,
            Duration::from_millis(3_000),
            message.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the error classifier.
    use super::*;

    fn http(status: u16, retry_after_ms: Option<u64>) -> SyncFailure {
        SyncFailure::Remote(RemoteError::Http {
            status,
            message: format!("status {status}"),
            retry_after_ms,
        })
    }

    #[test]
    fn network_errors_retry_after_one_second() {
        let verdict = classify(&SyncFailure::Remote(RemoteError::Network("reset".into())));
        assert_eq!(verdict.category, ErrorCategory::Network);
        assert!(verdict.is_retryable);
        assert_eq!(verdict.suggested_delay, Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn timeouts_classify_as_network() {
        let verdict =
            classify(&SyncFailure::Remote(RemoteError::Timeout(Duration::from_secs(30))));
        assert_eq!(verdict.category, ErrorCategory::Network);
        assert!(verdict.is_retryable);
    }

    #[test]
    fn rate_limit_honors_retry_after_header() {
        let verdict = classify(&http(429, Some(2_000)));
        assert_eq!(verdict.category, ErrorCategory::RateLimit);
        assert!(verdict.is_retryable);
        assert_eq!(verdict.retry_after, Some(Duration::from_millis(2_000)));
    }

    /// Boundary from the drain policy: a 429 without a header waits the
    /// default 60 seconds.
    #[test]
    fn rate_limit_without_header_defaults_to_sixty_seconds() {
        let verdict = classify(&http(429, None));
        assert_eq!(verdict.retry_after, Some(Duration::from_millis(60_000)));
        assert_eq!(verdict.suggested_delay, Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn auth_statuses_are_terminal() {
        for status in [401, 403] {
            let verdict = classify(&http(status, None));
            assert_eq!(verdict.category, ErrorCategory::Authentication);
            assert!(!verdict.is_retryable);
        }
    }

    #[test]
    fn client_error_statuses_are_terminal() {
        for status in [400, 404, 422] {
            let verdict = classify(&http(status, None));
            assert_eq!(verdict.category, ErrorCategory::ClientError);
            assert!(!verdict.is_retryable);
        }
    }

    #[test]
    fn server_errors_retry_after_five_seconds() {
        for status in [500, 502, 503, 599] {
            let verdict = classify(&http(status, None));
            assert_eq!(verdict.category, ErrorCategory::ServerError);
            assert!(verdict.is_retryable);
            assert_eq!(verdict.suggested_delay, Some(Duration::from_millis(5_000)));
        }
    }

    #[test]
    fn conflict_retries_after_two_seconds() {
        let verdict = classify(&http(409, None));
        assert_eq!(verdict.category, ErrorCategory::Conflict);
        assert_eq!(verdict.suggested_delay, Some(Duration::from_millis(2_000)));
    }

    #[test]
    fn unexpected_statuses_are_unknown_but_retryable() {
        let verdict = classify(&http(418, None));
        assert_eq!(verdict.category, ErrorCategory::Unknown);
        assert!(verdict.is_retryable);
        assert_eq!(verdict.suggested_delay, Some(Duration::from_millis(3_000)));
    }

    #[test]
    fn unauthenticated_is_terminal() {
        let verdict = classify(&SyncFailure::Remote(RemoteError::Unauthenticated));
        assert_eq!(verdict.category, ErrorCategory::Authentication);
        assert!(!verdict.is_retryable);
    }

    #[test]
    fn invalid_records_are_terminal_client_errors() {
        let verdict = classify(&SyncFailure::InvalidRecord("chapter without project".into()));
        assert_eq!(verdict.category, ErrorCategory::ClientError);
        assert!(!verdict.is_retryable);
    }

    #[test]
    fn crypto_failures_retry_conservatively() {
        let verdict = classify(&SyncFailure::Crypto("nonce generation failed".into()));
        assert_eq!(verdict.category, ErrorCategory::Unknown);
        assert!(verdict.is_retryable);
    }

    /// Classification is deterministic on (status, retry-after presence).
    #[test]
    fn classification_is_deterministic() {
        let a = classify(&http(503, None));
        let b = classify(&http(503, None));
        assert_eq!(a, b);
    }
}
