//! CLI-specific error types

use thiserror::Error;

/// Errors raised before any authentication work starts.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("no password provided: set SAGA_PASSWORD or pipe it on stdin")]
    MissingPassword,

    #[error("reading password: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using CLI Error
pub type Result<T> = std::result::Result<T, Error>;
