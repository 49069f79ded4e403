use thiserror::Error;

use crate::storage::page::BlockNumber;

pub type GistResult<T, E = GistError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum GistError {
    #[error("index contains corrupted page at block {block}: {reason}. Please REINDEX it.")]
    CorruptedPage { block: BlockNumber, reason: String },

    #[error("operator class contract violation: {0}")]
    OpclassContractViolation(String),

    #[error("structural limit exceeded: {0}")]
    StructuralLimit(String),

    #[error("canceling statement due to user request")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant failed: {0}")]
    InvariantFailed(String),

    #[error("{message}")]
    InvalidOption { message: String, detail: String },

    #[error("Not support: {0}")]
    NotSupported(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GistError {
    pub fn corrupted(block: BlockNumber, reason: impl Into<String>) -> Self {
        GistError::CorruptedPage {
            block,
            reason: reason.into(),
        }
    }

    /// Secondary message attached to option parsing failures.
    pub fn detail(&self) -> Option<&str> {
        match self {
            GistError::InvalidOption { detail, .. } if !detail.is_empty() => Some(detail),
            _ => None,
        }
    }
}
