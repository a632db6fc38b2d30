//! Sync and export error types.

use keyrelay_metadata::MetadataError;
use keyrelay_signer::SignerError;
use keyrelay_storage::StorageError;
use thiserror::Error;

/// Error raised while synchronizing with a partner or generating exports.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("integrity error in batch from {peer}: {reason}")]
    PeerIntegrity { peer: String, reason: String },

    #[error("transport error for {peer}: {message}")]
    Transport { peer: String, message: String },

    #[error("signing error: {0}")]
    Signing(#[from] SignerError),

    #[error("key store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] keyrelay_core::Error),

    #[error("export encoding error: {0}")]
    Encoding(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure class used for logging and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    PeerIntegrity,
    Transport,
    Signing,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerIntegrity => "peer_integrity",
            Self::Transport => "transport",
            Self::Signing => "signing",
            Self::Internal => "internal",
        }
    }
}

impl SyncError {
    pub fn transport(peer: &str, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            message: message.to_string(),
        }
    }

    pub fn integrity(peer: &str, reason: impl std::fmt::Display) -> Self {
        Self::PeerIntegrity {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PeerIntegrity { .. } => ErrorKind::PeerIntegrity,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Signing(_) => ErrorKind::Signing,
            Self::Metadata(_)
            | Self::Storage(_)
            | Self::Core(_)
            | Self::Encoding(_)
            | Self::Config(_) => ErrorKind::Internal,
        }
    }
}

impl From<zip::result::ZipError> for SyncError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Result type for sync and export operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
