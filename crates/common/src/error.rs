//! Error type shared by the common building blocks.

use thiserror::Error;

/// Errors raised by common utilities (crypto, resilience configuration).
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommonError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result type alias for common operations.
pub type CommonResult<T> = Result<T, CommonError>;
