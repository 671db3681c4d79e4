//! store-core: shared-memory buffer pool for the append-only store.
//!
//! This crate provides the storage layer that append blocks are built on:
//!
//! - **References**: `BufferReference`, a packed (class, slot, flag) handle
//!   that names a buffer across processes
//! - **Allocator**: `BucketAllocator`, durable per-class slot bookkeeping
//!   with a free list keyed by writer-process id
//! - **Store**: `SharedBucketStore`, one growable memory-mapped file per
//!   bucket class
//! - **Pool**: `PooledMemoryPool`, reference-counted buffer handles with a
//!   single in-process handle per buffer
//!
//! # Architecture
//!
//! ```text
//!                 +--------------------------+
//!                 |     PooledMemoryPool     |
//!                 |  (handles + ref counts)  |
//!                 +------------+-------------+
//!                              |
//!               +--------------+--------------+
//!               v                             v
//!      +-----------------+          +-------------------+
//!      | BucketAllocator |          | SharedBucketStore |
//!      |  (LMDB index)   |          |  (mmap per class) |
//!      +-----------------+          +-------------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use store_core::*;
//!
//! let pool = PooledMemoryPoolBuilder::new("/var/lib/store")
//!     .max_total_size(256 * 1024 * 1024)
//!     .build()?;
//!
//! let buffer = pool.rent(10_000)?;
//! let view = buffer.retain()?;
//! view.view().write(0, b"hello")?;
//! view.release();
//! pool.return_buffer(&buffer, false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types
mod bucket;
mod config;
mod error;
mod reference;
pub mod sync;

// Re-exports
pub use bucket::{DEFAULT_PAGE_SIZE, bucket_size, rounded_length, size_to_class};
pub use config::{MIN_PAGE_SIZE, StoreConfig, deserialize_size, parse_size};
pub use error::{Result, StoreError};
pub use reference::{BufferReference, MAX_BUCKET_CLASS};

// Allocation
mod allocator;

pub use allocator::{BucketAllocator, FIRST_SLOT, RecoveryStats, SlotEntry, SlotState};

// Mapped storage
mod region;
mod store;

pub use store::{BufferView, SharedBucketStore};

// Pool
mod pool;

pub use pool::{PooledBuffer, PooledMemoryPool, PooledMemoryPoolBuilder, RetainedView};

// Metrics
pub mod metrics;

pub use metrics::{ClassStats, PoolStats};
