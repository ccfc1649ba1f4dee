//! Error types for the Tollgate service.

use thiserror::Error;

use crate::ratelimit::LimitType;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request was rejected by one of the limit tiers
    #[error("{message}")]
    LimitExceeded {
        limit_type: LimitType,
        current_usage: u64,
        limit: u64,
        retry_after_seconds: u64,
        message: String,
    },

    /// The shared counter store could not be reached in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A rejected configuration write; stored config is left untouched
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unknown API key, client id or tier id
    #[error("Not found: {0}")]
    UnknownClientOrTier(String),

    /// The client exists but is deactivated
    #[error("Client account is inactive: {0}")]
    InactiveClient(String),

    /// A tier that is still assigned to clients cannot be deleted
    #[error("Tier {0} is assigned to at least one client")]
    TierInUse(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::store::StoreError> for TollgateError {
    fn from(err: crate::store::StoreError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
