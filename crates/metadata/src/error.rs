//! Key store error types.

use thiserror::Error;

/// Key store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Config(err.to_string())
    }
}

impl From<keyrelay_core::Error> for MetadataError {
    fn from(err: keyrelay_core::Error) -> Self {
        MetadataError::CorruptRow(err.to_string())
    }
}

/// Result type for key store operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
