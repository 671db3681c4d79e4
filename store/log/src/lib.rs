//! append-log: versioned append blocks and logs over pooled buffers.
//!
//! An [`AppendBlock`] lays out a header and a run of length-prefixed frames
//! in a [`PooledBuffer`](store_core::PooledBuffer). Writers claim a version
//! and space with one atomic on the block tail, fill the claimed bytes, and
//! commit in claim order. Readers in this or another process follow the
//! commit pointer stored in the block header.
//!
//! An [`AppendLog`] keeps one writable block per stream and rotates to a new
//! block when the active one fills. Completed blocks go to a [`BlockSink`],
//! such as the LMDB-backed [`BlockArchive`] or a [`PendingBlocks`] queue.
//!
//! # Block Layout
//!
//! ```text
//! +------------------------- header (64B) --------------------------+
//! | magic | stream_id | first_version | value_size | state | committed |
//! +------------------------------------------------------------------+
//! | len | payload | pad | len | payload | pad | ...                  |
//! +------------------------------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use append_log::*;
//! use store_core::PooledMemoryPoolBuilder;
//!
//! let pool = PooledMemoryPoolBuilder::new("/var/lib/store").build()?;
//! let log = AppendLog::new(pool, DiscardSink::new(), LogConfig::default(), 1, -1, 0)?;
//!
//! assert_eq!(log.append(b"first")?, 0);
//! assert_eq!(log.append(b"second")?, 1);
//! log.close()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod archive;
mod block;
mod config;
mod cursor;
mod error;
mod log;
pub mod metrics;
mod pending;
mod retired;
mod state;

pub use archive::{ArchivedBlock, BlockArchive};
pub use block::{
    AppendBlock, BLOCK_MAGIC, Claim, ClaimToken, FRAME_PREFIX, HEADER_SIZE, MAX_PAYLOAD, frame_len,
    min_block_len,
};
pub use config::LogConfig;
pub use cursor::{BlockCursor, Frames};
pub use error::{DisposeError, LogError, Result};
pub use log::{AppendLog, BlockSink, DiscardSink};
pub use pending::PendingBlocks;
pub use retired::RetiredBlocks;
pub use state::{BlockState, MAX_ENTRIES, Tail};
