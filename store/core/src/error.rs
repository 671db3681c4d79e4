//! Error types for allocator, store, and pool operations.

use crate::reference::BufferReference;

/// Errors that can occur in the bucket store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The configured maximum total size would be exceeded.
    #[error("not enough space: requested {requested} bytes, {available} available")]
    NotEnoughSpace {
        /// Bytes the request needed.
        requested: usize,
        /// Bytes still available under the budget.
        available: usize,
    },

    /// Bucket class outside the configured range.
    #[error("bucket class {class} out of range (max {max})")]
    BucketOutOfRange {
        /// Requested class.
        class: u8,
        /// Largest configured class.
        max: u8,
    },

    /// The reference is not currently allocated.
    #[error("buffer {0} is not allocated")]
    NotFound(BufferReference),

    /// Operation not legal in the handle's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Disposal attempted while retained views are outstanding.
    #[error("buffer still retained by {ref_count} view(s)")]
    StillRetained {
        /// Outstanding retained views.
        ref_count: u32,
    },

    /// The handle was already disposed.
    #[error("buffer already disposed")]
    AlreadyDisposed,

    /// A view or access fell outside the buffer.
    #[error("range {offset}..{offset}+{len} exceeds capacity {capacity}")]
    InvalidRange {
        /// Start of the range.
        offset: usize,
        /// Length of the range.
        len: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// Inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Memory-map or file I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable allocation index failure.
    #[error("index error: {0}")]
    Index(#[from] heed::Error),
}

impl StoreError {
    /// Capacity errors may succeed if the caller frees buffers and retries.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::NotEnoughSpace { .. } | Self::BucketOutOfRange { .. }
        )
    }

    /// Protocol errors are caller bugs: an illegal state transition.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidState(_)
                | Self::StillRetained { .. }
                | Self::AlreadyDisposed
                | Self::InvalidRange { .. }
        )
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
