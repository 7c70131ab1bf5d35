//! Error types for the Throttler middleware.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Throttler operations.
#[derive(Error, Debug)]
pub enum ThrottlerError {
    /// Missing or invalid configuration. Fatal at setup time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or answered badly
    #[error("Limiter unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A deferred job could not be handed back to the scheduler
    #[error("Failed to reschedule job: {0}")]
    Reschedule(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ThrottlerError {
    fn from(e: config::ConfigError) -> Self {
        ThrottlerError::Config(e.to_string())
    }
}

/// Result type alias for Throttler operations.
pub type Result<T> = std::result::Result<T, ThrottlerError>;
