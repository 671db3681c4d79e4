//! Append log: a stream of versioned entries over rotating blocks.
//!
//! Appends claim space on the active block under a shared lock. When the
//! active block is full the appender takes the exclusive lock, rents and
//! initializes a successor at the next version, completes the old block and
//! hands it to a [`BlockSink`]. The append is then retried on the new
//! block; if a fresh block cannot hold the entry either, the append fails.
//!
//! The shared lock pins the active block for the duration of one append:
//! claim, fill and commit. Taking it is a single atomic add on the
//! uncontended path, and claims among appenders are ordered by the block's
//! tail CAS, not by the lock. Rotation waits for appends already in flight,
//! so a slow `fill` delays only the rotation that follows it.

use crate::archive::BlockArchive;
use crate::block::{AppendBlock, Claim, ClaimToken, MAX_PAYLOAD};
use crate::config::LogConfig;
use crate::cursor::BlockCursor;
use crate::error::{LogError, Result};
use crate::metrics::{ROTATIONS, SINK_FAILURES};
use crate::retired::RetiredBlocks;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use store_core::{BufferReference, PooledMemoryPool};
use tracing::{info, warn};

/// Destination for completed blocks.
pub trait BlockSink: Send + Sync {
    /// Take ownership of a completed block.
    ///
    /// The sink is responsible for eventually calling
    /// [`AppendBlock::dispose_free`], which fails while readers still
    /// retain the block.
    fn accept(&self, block: AppendBlock) -> Result<()>;
}

impl<T: BlockSink + ?Sized> BlockSink for Arc<T> {
    fn accept(&self, block: AppendBlock) -> Result<()> {
        (**self).accept(block)
    }
}

/// Sink that returns completed blocks to the pool without keeping them.
///
/// Blocks that readers still retain are held until their cursors are
/// released and a later accept or [`reap`](Self::reap) frees them.
#[derive(Debug, Default)]
pub struct DiscardSink {
    retired: RetiredBlocks,
}

impl DiscardSink {
    /// Create a sink with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks waiting for readers to detach.
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Free held blocks that no reader retains.
    pub fn reap(&self) -> Result<usize> {
        self.retired.reap()
    }
}

impl BlockSink for DiscardSink {
    fn accept(&self, block: AppendBlock) -> Result<()> {
        block.complete();
        if !self.retired.is_empty() {
            self.retired.reap()?;
        }
        self.retired.dispose_or_retire(block)
    }
}

/// Versioned append log for one stream.
pub struct AppendLog<S: BlockSink> {
    pool: PooledMemoryPool,
    sink: S,
    config: LogConfig,
    stream_id: i64,
    value_size: i16,
    throughput_hint: AtomicUsize,
    active: RwLock<AppendBlock>,
}

impl<S: BlockSink> AppendLog<S> {
    /// Create a log whose first entry gets `first_version`.
    pub fn new(
        pool: PooledMemoryPool,
        sink: S,
        config: LogConfig,
        stream_id: i64,
        value_size: i16,
        first_version: u64,
    ) -> Result<Self> {
        config.validate()?;

        let hint = config.throughput_hint;
        let entry_len = value_size.max(0) as usize;
        let block = new_block(
            &pool,
            config.block_size(hint, entry_len),
            stream_id,
            value_size,
            first_version,
        )?;

        info!(stream_id, first_version, "opened append log");

        Ok(Self {
            pool,
            sink,
            config,
            stream_id,
            value_size,
            throughput_hint: AtomicUsize::new(hint),
            active: RwLock::new(block),
        })
    }

    /// Reopen the log of `stream_id` after the last archived version.
    ///
    /// A stream with nothing archived starts at version 0. Entries that were
    /// only in the active block of a previous process are not recovered.
    pub fn resume(
        pool: PooledMemoryPool,
        sink: S,
        config: LogConfig,
        stream_id: i64,
        value_size: i16,
        archive: &BlockArchive,
    ) -> Result<Self> {
        let first_version = archive.next_version(stream_id)?.unwrap_or(0);
        Self::new(pool, sink, config, stream_id, value_size, first_version)
    }

    /// Stream this log appends to.
    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }

    /// Value size recorded in every block.
    pub fn value_size(&self) -> i16 {
        self.value_size
    }

    /// The sink receiving completed blocks.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Version the next append receives.
    pub fn next_version(&self) -> u64 {
        self.active.read().next_version()
    }

    /// First version of the active block.
    pub fn active_first_version(&self) -> u64 {
        self.active.read().first_version()
    }

    /// Buffer reference of the active block.
    pub fn active_reference(&self) -> BufferReference {
        self.active.read().reference()
    }

    /// Attach a reader to the active block.
    ///
    /// The cursor keeps the block's buffer allocated after rotation until
    /// it is released.
    pub fn cursor(&self) -> Result<BlockCursor> {
        self.active.read().cursor()
    }

    /// Update the bytes-per-minute hint used to size future blocks.
    pub fn set_throughput_hint(&self, bytes_per_minute: usize) {
        self.throughput_hint.store(bytes_per_minute, Ordering::Relaxed);
    }

    /// Append `value` at the next version and return that version.
    pub fn append(&self, value: &[u8]) -> Result<u64> {
        self.append_inner(None, value.len(), |token| token.write(0, value))
    }

    /// Append `value` at a caller-chosen version.
    ///
    /// Fails with `OutOfOrder` unless `version` is the next one.
    pub fn append_at(&self, version: u64, value: &[u8]) -> Result<u64> {
        self.append_inner(Some(version), value.len(), |token| token.write(0, value))
    }

    /// Append an entry of `size` bytes written by `fill` before commit.
    ///
    /// If `fill` fails or panics the claim is abandoned and its version is
    /// handed to the next append. `fill` runs while the active block is
    /// pinned, so rotation waits for it.
    pub fn append_with<F>(&self, size: usize, fill: F) -> Result<u64>
    where
        F: FnOnce(&ClaimToken<'_>) -> Result<()>,
    {
        self.append_inner(None, size, fill)
    }

    fn append_inner<F>(&self, version: Option<u64>, size: usize, fill: F) -> Result<u64>
    where
        F: FnOnce(&ClaimToken<'_>) -> Result<()>,
    {
        if size > MAX_PAYLOAD {
            return Err(LogError::RotationFailed { size });
        }

        let mut fill = Some(fill);
        let mut rotated = false;

        loop {
            let (reference, fresh) = {
                let active = self.active.read();
                let want = version.unwrap_or_else(|| active.next_version());

                match active.claim(want, size)? {
                    Claim::Claimed(token) => {
                        if let Some(fill) = fill.take() {
                            fill(&token)?;
                        }
                        return token.commit();
                    }
                    Claim::OutOfOrder { expected } => {
                        if version.is_some() {
                            return Err(LogError::OutOfOrder {
                                expected,
                                got: want,
                            });
                        }
                        // lost the version to a concurrent appender
                        continue;
                    }
                    Claim::Full => (active.reference(), active.claimed() == 0),
                }
            };

            if rotated && fresh {
                return Err(LogError::RotationFailed { size });
            }
            rotated = self.rotate(reference, size)?;
        }
    }

    /// Replace the active block if it is still `observed`.
    ///
    /// Returns false if another appender rotated first. Once the new block
    /// is active a sink failure is logged, not returned, since the append
    /// can proceed on the new block.
    fn rotate(&self, observed: BufferReference, entry_len: usize) -> Result<bool> {
        let mut active = self.active.write();
        if active.reference() != observed {
            return Ok(false);
        }

        // claims only happen under the shared lock, so the tail is stable
        let next_version = active.next_version();
        let size = self
            .config
            .block_size(self.throughput_hint.load(Ordering::Relaxed), entry_len);

        let block = new_block(
            &self.pool,
            size,
            self.stream_id,
            self.value_size,
            next_version,
        )?;
        active.complete();
        let completed = std::mem::replace(&mut *active, block);
        drop(active);

        ROTATIONS.increment();
        info!(
            stream_id = self.stream_id,
            completed_first_version = completed.first_version(),
            entries = completed.len(),
            next_version,
            block_size = size,
            "rotated append block"
        );

        if let Err(e) = self.sink.accept(completed) {
            SINK_FAILURES.increment();
            warn!(
                stream_id = self.stream_id,
                error = %e,
                "sink failed to accept completed block"
            );
        }
        Ok(true)
    }

    /// Complete the active block, hand it to the sink and return the sink.
    pub fn close(self) -> Result<S> {
        let block = self.active.into_inner();
        block.complete();
        self.sink.accept(block)?;
        Ok(self.sink)
    }
}

fn new_block(
    pool: &PooledMemoryPool,
    size: usize,
    stream_id: i64,
    value_size: i16,
    first_version: u64,
) -> Result<AppendBlock> {
    let buffer = pool.rent(size)?;
    match AppendBlock::initialize(&buffer, stream_id, value_size, first_version) {
        Ok(block) => Ok(block),
        Err(e) => {
            if let Err(return_err) = pool.return_buffer(&buffer, false) {
                warn!(error = %return_err, "failed to return block buffer");
            }
            Err(e)
        }
    }
}
