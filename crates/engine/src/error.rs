//! Engine error types.

use coldvault_protocol::TreeHash;
use coldvault_transfer::TransferError;

use crate::transport::TransportError;

/// Errors produced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tree hash mismatch: expected {expected}, got {actual}")]
    Integrity { expected: TreeHash, actual: TreeHash },

    #[error("upload of part at offset {offset} failed: {reason}")]
    Upload { offset: u64, reason: String },

    #[error("download of range {offset}+{length} failed: {reason}")]
    Download {
        offset: u64,
        length: u64,
        reason: String,
    },

    #[error("retrieval job {job_id} failed: {message}")]
    RetrievalFailed { job_id: String, message: String },

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<TransferError> for VaultError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => Self::Io(e),
            TransferError::Config(msg) => Self::Config(msg),
            TransferError::Integrity { expected, actual } => Self::Integrity { expected, actual },
            other @ (TransferError::SlotOutOfRange { .. }
            | TransferError::SlotOccupied(_)
            | TransferError::SlotMissing(_)) => Self::Protocol(other.to_string()),
        }
    }
}

impl From<TransportError> for VaultError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(what) => Self::NotFound(what),
            TransportError::Integrity { expected, actual } => Self::Integrity { expected, actual },
            other => Self::Transport(other),
        }
    }
}
