//! Error types for append blocks, logs, and the block archive.

use crate::block::AppendBlock;
use store_core::StoreError;

/// Errors that can occur while appending or archiving.
///
/// A full block is not an error; see [`crate::Claim::Full`].
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Pool or allocator failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The buffer cannot hold a header plus one entry.
    #[error("buffer of {len} bytes is too small for a block (need {required})")]
    BlockTooSmall {
        /// Buffer length.
        len: usize,
        /// Smallest usable length.
        required: usize,
    },

    /// Claim attempted on a block that is not writable.
    #[error("block is not writable")]
    BlockNotWritable,

    /// Caller-supplied version is not the next expected one.
    #[error("out of order version: expected {expected}, got {got}")]
    OutOfOrder {
        /// Next version the block accepts.
        expected: u64,
        /// Version presented.
        got: u64,
    },

    /// An earlier claim was never committed.
    #[error("commit of version {version} is blocked by an earlier claim")]
    CommitOutOfOrder {
        /// Version of the claim being committed.
        version: u64,
    },

    /// Claims are still outstanding on the block.
    #[error("{claimed} entries claimed but only {committed} committed")]
    UnfinishedClaims {
        /// Entries claimed.
        claimed: u32,
        /// Entries committed.
        committed: u32,
    },

    /// The claim CAS kept losing races.
    #[error("claim contended after {attempts} attempts")]
    Contended {
        /// Attempts made.
        attempts: u32,
    },

    /// Block or archive record failed validation.
    #[error("corrupted block: {0}")]
    Corrupted(&'static str),

    /// A freshly rotated block could not hold the entry.
    #[error("entry of {size} bytes does not fit a new block")]
    RotationFailed {
        /// Payload size of the entry.
        size: usize,
    },

    /// Durable archive failure.
    #[error("archive error: {0}")]
    Index(#[from] heed::Error),

    /// File I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogError {
    /// Errors caused by calling an operation in the wrong state.
    pub fn is_protocol(&self) -> bool {
        match self {
            LogError::Store(e) => e.is_protocol(),
            LogError::BlockNotWritable
            | LogError::OutOfOrder { .. }
            | LogError::CommitOutOfOrder { .. }
            | LogError::UnfinishedClaims { .. } => true,
            _ => false,
        }
    }
}

/// Result type for append log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// A block whose buffer could not be returned, handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("failed to dispose block: {error}")]
pub struct DisposeError {
    /// Why the buffer was kept.
    #[source]
    pub error: LogError,
    /// The block, still owning its buffer.
    pub block: AppendBlock,
}

impl DisposeError {
    /// Check whether a reader still retained the buffer.
    pub fn is_shared(&self) -> bool {
        matches!(self.error, LogError::Store(StoreError::StillRetained { .. }))
    }

    /// Split into the block and the error.
    pub fn into_parts(self) -> (AppendBlock, LogError) {
        (self.block, self.error)
    }
}
