//! Error types for session operations

/// Errors from multi-user session bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vault: {0}")]
    Storage(#[from] shelf_auth::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
