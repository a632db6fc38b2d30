//! Signer error types.

use thiserror::Error;

/// Signing operation errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("certificate parsing error: {0}")]
    Certificate(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("key source error: {0}")]
    Source(#[from] keyrelay_core::Error),
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
