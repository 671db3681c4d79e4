//! Versioned append block over a pooled buffer.
//!
//! An [`AppendBlock`] lays a fixed header and a sequence of entry frames
//! over one pooled buffer. Writers append in two phases: [`AppendBlock::claim`]
//! reserves the next version and space, and [`ClaimToken::commit`] publishes
//! the entry by advancing the commit pointer stored in the header. Readers,
//! in this process or another one mapping the same store, only ever read up
//! to the commit pointer.
//!
//! # Buffer Layout
//!
//! ```text
//! +--------+-----------+---------------+------------+-------+-----------+------+
//! | magic  | stream_id | first_version | value_size | state | committed | data |
//! | 8B     | 8B        | 8B            | 2B         | 1B    | 8B @ 32   | @ 64 |
//! +--------+-----------+---------------+------------+-------+-----------+------+
//! ```
//!
//! `committed` packs `(count << 32) | data_offset`. Each entry frame is a
//! 4-byte little-endian payload length followed by the payload, padded to
//! 8 bytes. Entry `i` has version `first_version + i`.
//!
//! A claim dropped without a commit is rolled back if it is still the
//! newest one. Otherwise later claims already hold the following versions,
//! so the frame is published with the high bit of its length set and
//! readers skip it.

use crate::cursor::{BlockCursor, Frames};
use crate::error::{DisposeError, LogError, Result};
use crate::metrics::{BLOCK_CLAIMS, BLOCKS_FULL, CLAIMS_ABANDONED};
use crate::state::{BlockState, Reserve, Tail, TailCell};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use store_core::{BufferReference, BufferView, PooledBuffer, RetainedView, StoreError};
use tracing::{debug, warn};

/// Magic bytes identifying an initialized block.
pub const BLOCK_MAGIC: [u8; 8] = *b"APNDBLK1";

/// Size of the block header.
pub const HEADER_SIZE: usize = 64;

/// Size of the length prefix of each entry frame.
pub const FRAME_PREFIX: usize = 4;

/// Length prefix bit marking the frame of an abandoned claim.
pub(crate) const SKIPPED_FRAME: u32 = 1 << 31;

/// Largest payload a single entry can carry.
pub const MAX_PAYLOAD: usize = (SKIPPED_FRAME - 1) as usize;

const STREAM_ID_OFFSET: usize = 8;
pub(crate) const FIRST_VERSION_OFFSET: usize = 16;
const VALUE_SIZE_OFFSET: usize = 24;
const STATE_OFFSET: usize = 26;
const COMMITTED_OFFSET: usize = 32;

/// Commit attempts before giving up on an earlier claim.
const COMMIT_WAIT_SPINS: u32 = 1 << 20;

/// Bytes a frame occupies for a payload of `len` bytes.
///
/// Saturates for lengths no buffer could hold.
#[inline]
pub fn frame_len(len: usize) -> usize {
    len.saturating_add(FRAME_PREFIX + 7) & !7
}

/// Smallest buffer that holds a header plus one entry of `value_size`.
///
/// Non-positive value sizes mark variable-length values, which need room
/// for at least an empty entry.
#[inline]
pub fn min_block_len(value_size: i16) -> usize {
    HEADER_SIZE + frame_len(value_size.max(0) as usize)
}

#[inline]
pub(crate) fn pack_committed(count: u32, offset: u32) -> u64 {
    ((count as u64) << 32) | offset as u64
}

#[inline]
pub(crate) fn unpack_committed(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Commit pointer in the header of `view`.
#[inline]
pub(crate) fn committed_word<'a>(view: &BufferView<'a>) -> &'a AtomicU64 {
    // SAFETY: views over blocks span at least the header, the buffer base is
    // page aligned and the offset is 8-byte aligned
    unsafe { AtomicU64::from_ptr(view.as_ptr().add(COMMITTED_OFFSET).cast::<u64>()) }
}

/// State byte in the header of `view`.
#[inline]
pub(crate) fn state_byte<'a>(view: &BufferView<'a>) -> &'a AtomicU8 {
    // SAFETY: views over blocks span at least the header
    unsafe { AtomicU8::from_ptr(view.as_ptr().add(STATE_OFFSET)) }
}

/// Committed data bytes of the block in `view`.
///
/// Committed frames are never written again, so the slice is stable.
pub(crate) fn committed_data<'a>(view: &BufferView<'a>, offset: u32) -> Result<&'a [u8]> {
    let data = view.slice(HEADER_SIZE, offset as usize)?;
    // SAFETY: bytes below the commit pointer are immutable
    Ok(unsafe { data.as_slice() })
}

/// Result of a claim attempt.
///
/// `Full` and `OutOfOrder` are ordinary outcomes, not errors: a full block
/// is the signal to rotate.
#[derive(Debug)]
pub enum Claim<'a> {
    /// The version and space are reserved.
    Claimed(ClaimToken<'a>),
    /// The remaining capacity does not fit the entry.
    Full,
    /// The version was not the next expected one.
    OutOfOrder {
        /// Next version the block accepts.
        expected: u64,
    },
}

/// An append-only block of versioned entries.
pub struct AppendBlock {
    buffer: PooledBuffer,
    /// Whole-buffer view held for the block's lifetime.
    owner: RetainedView,
    stream_id: i64,
    first_version: u64,
    value_size: i16,
    capacity: u32,
    tail: TailCell,
}

impl AppendBlock {
    /// Lay out a new writable block over `buffer`.
    ///
    /// Fails with `BlockTooSmall` if the buffer cannot hold the header plus
    /// one entry.
    pub fn initialize(
        buffer: &PooledBuffer,
        stream_id: i64,
        value_size: i16,
        first_version: u64,
    ) -> Result<Self> {
        let required = min_block_len(value_size);
        if buffer.length() < required {
            return Err(LogError::BlockTooSmall {
                len: buffer.length(),
                required,
            });
        }

        let owner = buffer.retain()?;
        let view = owner.view();

        view.write(0, &BLOCK_MAGIC)?;
        view.write(STREAM_ID_OFFSET, &stream_id.to_le_bytes())?;
        view.write(FIRST_VERSION_OFFSET, &first_version.to_le_bytes())?;
        view.write(VALUE_SIZE_OFFSET, &value_size.to_le_bytes())?;
        committed_word(&view).store(0, Ordering::Release);
        state_byte(&view).store(BlockState::Writable as u8, Ordering::Release);

        let capacity = data_capacity(buffer.length());
        debug!(
            stream_id,
            first_version,
            reference = %buffer.reference(),
            capacity,
            "initialized block"
        );

        Ok(Self {
            buffer: buffer.clone(),
            owner,
            stream_id,
            first_version,
            value_size,
            capacity,
            tail: TailCell::new(Tail {
                state: BlockState::Writable,
                count: 0,
                offset: 0,
            }),
        })
    }

    /// Attach to a block already initialized in `buffer`.
    ///
    /// Claims resume after the last committed entry.
    pub fn open(buffer: &PooledBuffer) -> Result<Self> {
        if buffer.length() < HEADER_SIZE {
            return Err(LogError::BlockTooSmall {
                len: buffer.length(),
                required: HEADER_SIZE,
            });
        }

        let view = buffer.view()?;

        let mut header = [0u8; VALUE_SIZE_OFFSET + 2];
        view.read(0, &mut header)?;
        if header[..8] != BLOCK_MAGIC {
            return Err(LogError::Corrupted("bad block magic"));
        }

        let stream_id = i64::from_le_bytes(read_array(&header, STREAM_ID_OFFSET));
        let first_version = u64::from_le_bytes(read_array(&header, FIRST_VERSION_OFFSET));
        let value_size = i16::from_le_bytes(read_array(&header, VALUE_SIZE_OFFSET));
        let state = BlockState::from_u8(state_byte(&view).load(Ordering::Acquire))
            .ok_or(LogError::Corrupted("bad block state"))?;
        let (count, offset) = unpack_committed(committed_word(&view).load(Ordering::Acquire));

        let capacity = data_capacity(buffer.length());
        if offset > capacity {
            return Err(LogError::Corrupted("commit pointer past capacity"));
        }

        let owner = buffer.retain()?;

        Ok(Self {
            buffer: buffer.clone(),
            owner,
            stream_id,
            first_version,
            value_size,
            capacity,
            tail: TailCell::new(Tail {
                state,
                count,
                offset,
            }),
        })
    }

    /// Stream this block belongs to.
    #[inline]
    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }

    /// Version of the first entry.
    #[inline]
    pub fn first_version(&self) -> u64 {
        self.first_version
    }

    /// Value size recorded for the stream.
    #[inline]
    pub fn value_size(&self) -> i16 {
        self.value_size
    }

    /// Reference of the underlying buffer.
    #[inline]
    pub fn reference(&self) -> BufferReference {
        self.buffer.reference()
    }

    /// The underlying buffer.
    #[inline]
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> BlockState {
        self.tail.load().state
    }

    /// Bytes available for entry frames.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes not yet claimed.
    pub fn remaining(&self) -> usize {
        (self.capacity - self.tail.load().offset) as usize
    }

    /// Next version a claim must present.
    pub fn next_version(&self) -> u64 {
        self.first_version + self.tail.load().count as u64
    }

    /// Entries claimed so far.
    pub fn claimed(&self) -> u32 {
        self.tail.load().count
    }

    /// Entries and data bytes published to readers.
    pub fn committed(&self) -> (u32, u32) {
        unpack_committed(committed_word(&self.owner.view()).load(Ordering::Acquire))
    }

    /// Number of committed entries, counting skipped frames.
    pub fn len(&self) -> u32 {
        self.committed().0
    }

    /// Check for a block without committed entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether some claims were never committed.
    pub fn has_unfinished_claims(&self) -> bool {
        self.claimed() != self.len()
    }

    /// Check whether readers other than the block itself retain the buffer.
    pub fn is_shared(&self) -> bool {
        self.buffer.ref_count() > 1
    }

    /// Committed frame bytes.
    pub fn committed_bytes(&self) -> Result<&[u8]> {
        let (_, offset) = self.committed();
        committed_data(&self.owner.view(), offset)
    }

    /// Iterate committed entries as `(version, payload)`.
    pub fn frames(&self) -> Result<Frames<'_>> {
        let (count, offset) = self.committed();
        let data = committed_data(&self.owner.view(), offset)?;
        Ok(Frames::new(data, self.first_version, count))
    }

    /// Attach a reader that follows the commit pointer.
    pub fn cursor(&self) -> Result<BlockCursor> {
        BlockCursor::attach(&self.buffer)
    }

    /// Claim `version` with room for `size` payload bytes.
    ///
    /// Fails only for protocol errors: the block is not writable or the
    /// CAS kept losing races.
    pub fn claim(&self, version: u64, size: usize) -> Result<Claim<'_>> {
        let frame = match u32::try_from(frame_len(size)) {
            Ok(frame) if size <= MAX_PAYLOAD => frame,
            _ => {
                BLOCKS_FULL.increment();
                return Ok(Claim::Full);
            }
        };

        match self
            .tail
            .reserve(self.first_version, version, frame, self.capacity)
        {
            Reserve::Reserved { index, offset } => {
                BLOCK_CLAIMS.increment();
                Ok(Claim::Claimed(ClaimToken {
                    block: self,
                    version,
                    index,
                    offset,
                    size,
                    settled: false,
                }))
            }
            Reserve::Full => {
                BLOCKS_FULL.increment();
                Ok(Claim::Full)
            }
            Reserve::OutOfOrder { expected } => Ok(Claim::OutOfOrder { expected }),
            Reserve::NotWritable => Err(LogError::BlockNotWritable),
            Reserve::Contended { attempts } => Err(LogError::Contended { attempts }),
        }
    }

    /// Stop accepting claims. Idempotent.
    pub fn complete(&self) {
        if self.tail.complete() {
            state_byte(&self.owner.view()).store(BlockState::Completed as u8, Ordering::Release);
            debug!(
                stream_id = self.stream_id,
                first_version = self.first_version,
                entries = self.claimed(),
                "completed block"
            );
        }
    }

    /// Complete the block and return its buffer to the pool.
    ///
    /// On failure the block comes back inside the error, still owning its
    /// buffer. That happens with `UnfinishedClaims` if a claim was never
    /// published, and with `StillRetained` while a reader retains the
    /// buffer.
    pub fn dispose_free(self) -> std::result::Result<(), DisposeError> {
        let claimed = self.claimed();
        let (committed, _) = self.committed();
        if claimed != committed {
            warn!(
                stream_id = self.stream_id,
                first_version = self.first_version,
                claimed,
                committed,
                "block disposed with unfinished claims"
            );
            return Err(DisposeError {
                error: LogError::UnfinishedClaims { claimed, committed },
                block: self,
            });
        }

        self.complete();

        let Self {
            buffer,
            owner,
            stream_id,
            first_version,
            value_size,
            capacity,
            tail,
        } = self;

        match buffer.pool().return_retained(owner) {
            Ok(()) => Ok(()),
            Err((owner, error)) => Err(DisposeError {
                error: error.into(),
                block: Self {
                    buffer,
                    owner,
                    stream_id,
                    first_version,
                    value_size,
                    capacity,
                    tail,
                },
            }),
        }
    }

    fn data_view(&self) -> BufferView<'_> {
        // SAFETY: capacity was derived from the buffer length
        unsafe {
            BufferView::from_raw_parts(
                self.owner.view().as_ptr().add(HEADER_SIZE),
                self.capacity as usize,
            )
        }
    }
}

impl std::fmt::Debug for AppendBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendBlock")
            .field("stream_id", &self.stream_id)
            .field("first_version", &self.first_version)
            .field("reference", &self.reference())
            .field("state", &self.state())
            .field("tail", &self.tail.load())
            .field("committed", &self.committed())
            .finish()
    }
}

/// A reserved, not yet published entry.
///
/// Write the payload, possibly in several parts, then [`commit`](Self::commit).
/// Dropping the token without a successful commit abandons the claim.
#[derive(Debug)]
pub struct ClaimToken<'a> {
    block: &'a AppendBlock,
    version: u64,
    index: u32,
    offset: u32,
    size: usize,
    settled: bool,
}

impl ClaimToken<'_> {
    /// Version of the claimed entry.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check for an empty payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Write `bytes` at `offset` within the payload.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(StoreError::InvalidRange {
                    offset,
                    len: bytes.len(),
                    capacity: self.size,
                }
                .into());
            }
        }
        let start = self.offset as usize + FRAME_PREFIX + offset;
        self.block.data_view().write(start, bytes)?;
        Ok(())
    }

    /// Publish the entry and return its version.
    ///
    /// Entries are published in claim order. If an earlier claim has not
    /// committed yet this waits briefly, then fails with
    /// `CommitOutOfOrder` and the claim is abandoned.
    pub fn commit(mut self) -> Result<u64> {
        // claims never exceed MAX_PAYLOAD
        self.publish(self.size as u32)?;
        self.settled = true;
        Ok(self.version)
    }

    /// Write the length prefix and advance the commit pointer past the frame.
    fn publish(&self, prefix: u32) -> Result<()> {
        self.block
            .data_view()
            .write(self.offset as usize, &prefix.to_le_bytes())?;

        let frame = frame_len(self.size) as u32;
        let start = pack_committed(self.index, self.offset);
        let end = pack_committed(self.index + 1, self.offset + frame);
        let committed = committed_word(&self.block.owner.view());

        let mut spins = 0;
        loop {
            match committed.compare_exchange_weak(start, end, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => {
                    let (count, _) = unpack_committed(actual);
                    if count > self.index {
                        return Err(LogError::Corrupted("entry committed twice"));
                    }
                    spins += 1;
                    if spins >= COMMIT_WAIT_SPINS {
                        return Err(LogError::CommitOutOfOrder {
                            version: self.version,
                        });
                    }
                    if spins % 64 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    fn abandon(&self) {
        CLAIMS_ABANDONED.increment();

        let frame = frame_len(self.size) as u32;
        if self.block.tail.rollback(self.index, self.offset, frame) {
            debug!(
                stream_id = self.block.stream_id,
                version = self.version,
                "rolled back abandoned claim"
            );
            return;
        }

        match self.publish(SKIPPED_FRAME | self.size as u32) {
            Ok(()) => debug!(
                stream_id = self.block.stream_id,
                version = self.version,
                "skipped abandoned claim"
            ),
            Err(e) => warn!(
                stream_id = self.block.stream_id,
                version = self.version,
                error = %e,
                "failed to skip abandoned claim"
            ),
        }
    }
}

impl Drop for ClaimToken<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}

fn data_capacity(len: usize) -> u32 {
    u32::try_from(len - HEADER_SIZE).unwrap_or(u32::MAX)
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use store_core::{PooledMemoryPool, PooledMemoryPoolBuilder};
    use tempfile::TempDir;

    fn create_pool(dir: &TempDir) -> PooledMemoryPool {
        PooledMemoryPoolBuilder::new(dir.path())
            .max_total_size(4 << 20)
            .segment_size(64 * 1024)
            .wpid(1)
            .build()
            .unwrap()
    }

    fn append(block: &AppendBlock, version: u64, value: &[u8]) -> Result<Option<u64>> {
        match block.claim(version, value.len())? {
            Claim::Claimed(token) => {
                token.write(0, value)?;
                token.commit().map(Some)
            }
            _ => Ok(None),
        }
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(0), 8);
        assert_eq!(frame_len(4), 8);
        assert_eq!(frame_len(5), 16);
        assert_eq!(frame_len(60), 64);
        assert_eq!(min_block_len(-1), HEADER_SIZE + 8);
        assert_eq!(min_block_len(16), HEADER_SIZE + 24);
    }

    #[test]
    fn test_initialize_and_claim() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();

        let block = AppendBlock::initialize(&buffer, 7, -1, 100).unwrap();
        assert_eq!(block.state(), BlockState::Writable);
        assert_eq!(block.capacity(), 4096 - HEADER_SIZE);
        assert_eq!(block.next_version(), 100);
        assert_eq!(buffer.ref_count(), 1);

        assert_eq!(append(&block, 100, b"first").unwrap(), Some(100));
        assert_eq!(append(&block, 101, b"second").unwrap(), Some(101));
        assert_eq!(block.len(), 2);
        assert_eq!(block.next_version(), 102);

        let frames: Vec<_> = block.frames().unwrap().collect();
        assert_eq!(frames, vec![(100, &b"first"[..]), (101, &b"second"[..])]);

        block.dispose_free().unwrap();
        assert!(!buffer.is_pooled());
    }

    #[test]
    fn test_initialize_too_small() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();

        let err = AppendBlock::initialize(&buffer, 1, 8000, 0).unwrap_err();
        assert!(matches!(err, LogError::BlockTooSmall { len: 4096, .. }));
        assert_eq!(buffer.ref_count(), 0);
        pool.return_buffer(&buffer, false).unwrap();
    }

    #[test]
    fn test_out_of_order_claims() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();

        assert!(matches!(
            block.claim(1, 8).unwrap(),
            Claim::OutOfOrder { expected: 0 }
        ));
        append(&block, 0, b"a").unwrap();
        assert!(matches!(
            block.claim(0, 8).unwrap(),
            Claim::OutOfOrder { expected: 1 }
        ));
        assert!(matches!(
            block.claim(5, 8).unwrap(),
            Claim::OutOfOrder { expected: 1 }
        ));

        block.dispose_free().unwrap();
    }

    #[test]
    fn test_full_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, 60, 0).unwrap();

        // 60 byte payloads take 64 byte frames: 63 fit in 4032 bytes
        for version in 0..63 {
            assert_eq!(append(&block, version, &[version as u8; 60]).unwrap(), Some(version));
        }
        assert_eq!(block.remaining(), 0);
        assert!(matches!(block.claim(63, 60).unwrap(), Claim::Full));
        assert!(matches!(block.claim(63, 0).unwrap(), Claim::Full));
        assert_eq!(block.next_version(), 63);

        block.dispose_free().unwrap();
    }

    #[test]
    fn test_claims_after_complete_fail() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();

        append(&block, 0, b"x").unwrap();
        block.complete();
        block.complete();
        assert_eq!(block.state(), BlockState::Completed);
        assert!(matches!(block.claim(1, 1), Err(LogError::BlockNotWritable)));
        assert!(matches!(block.claim(0, 1), Err(LogError::BlockNotWritable)));

        block.dispose_free().unwrap();
    }

    #[test]
    fn test_multi_part_write_before_commit() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, 12, 0).unwrap();

        let Claim::Claimed(token) = block.claim(0, 12).unwrap() else {
            panic!("expected claim");
        };
        token.write(0, &1u32.to_le_bytes()).unwrap();
        assert!(block.frames().unwrap().next().is_none());
        token.write(4, &2u64.to_le_bytes()).unwrap();
        assert!(token.write(8, &[0u8; 8]).is_err());
        assert_eq!(token.commit().unwrap(), 0);

        let (version, payload) = block.frames().unwrap().next().unwrap();
        assert_eq!(version, 0);
        assert_eq!(&payload[..4], &1u32.to_le_bytes());
        assert_eq!(&payload[4..], &2u64.to_le_bytes());

        block.dispose_free().unwrap();
    }

    #[test]
    fn test_commit_out_of_order() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();

        let Claim::Claimed(first) = block.claim(0, 4).unwrap() else {
            panic!("expected claim");
        };
        let Claim::Claimed(second) = block.claim(1, 4).unwrap() else {
            panic!("expected claim");
        };
        assert!(matches!(
            second.commit(),
            Err(LogError::CommitOutOfOrder { version: 1 })
        ));
        // the failed claim was the newest, so its version is free again
        assert_eq!(block.next_version(), 1);
        assert_eq!(first.commit().unwrap(), 0);
        assert!(!block.has_unfinished_claims());
        assert_eq!(append(&block, 1, b"next").unwrap(), Some(1));

        block.dispose_free().unwrap();
    }

    #[test]
    fn test_dropped_claim_rolls_back() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 10).unwrap();

        append(&block, 10, b"a").unwrap();
        let Claim::Claimed(token) = block.claim(11, 32).unwrap() else {
            panic!("expected claim");
        };
        token.write(0, &[9u8; 32]).unwrap();
        drop(token);

        assert_eq!(block.next_version(), 11);
        assert_eq!(block.remaining(), block.capacity() - 8);
        assert_eq!(append(&block, 11, b"b").unwrap(), Some(11));

        let frames: Vec<_> = block.frames().unwrap().collect();
        assert_eq!(frames, vec![(10, &b"a"[..]), (11, &b"b"[..])]);
        block.dispose_free().unwrap();
    }

    #[test]
    fn test_abandoned_older_claim_is_skipped() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();

        let Claim::Claimed(older) = block.claim(0, 4).unwrap() else {
            panic!("expected claim");
        };
        let Claim::Claimed(newer) = block.claim(1, 4).unwrap() else {
            panic!("expected claim");
        };
        drop(older);
        newer.write(0, b"live").unwrap();
        assert_eq!(newer.commit().unwrap(), 1);

        assert_eq!(block.len(), 2);
        assert!(!block.has_unfinished_claims());
        let frames: Vec<_> = block.frames().unwrap().collect();
        assert_eq!(frames, vec![(1, &b"live"[..])]);
        block.dispose_free().unwrap();
    }

    #[test]
    fn test_oversized_claim_is_full() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();

        assert!(frame_len(usize::MAX) > MAX_PAYLOAD);
        assert!(matches!(block.claim(0, usize::MAX).unwrap(), Claim::Full));
        assert!(matches!(block.claim(0, usize::MAX - 8).unwrap(), Claim::Full));
        assert!(matches!(block.claim(0, MAX_PAYLOAD + 1).unwrap(), Claim::Full));
        assert_eq!(block.next_version(), 0);
        assert_eq!(block.remaining(), block.capacity());

        assert_eq!(append(&block, 0, b"fits").unwrap(), Some(0));
        block.dispose_free().unwrap();
    }

    #[test]
    fn test_open_existing_block() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(8192).unwrap();

        let writer = AppendBlock::initialize(&buffer, -3, 4, 50).unwrap();
        append(&writer, 50, b"abcd").unwrap();
        append(&writer, 51, b"efgh").unwrap();

        let reader = AppendBlock::open(&pool.lookup(buffer.reference()).unwrap()).unwrap();
        assert_eq!(reader.stream_id(), -3);
        assert_eq!(reader.first_version(), 50);
        assert_eq!(reader.value_size(), 4);
        assert_eq!(reader.state(), BlockState::Writable);
        assert_eq!(reader.next_version(), 52);
        assert_eq!(reader.len(), 2);

        writer.complete();
        drop(reader);
        let reopened = AppendBlock::open(&buffer).unwrap();
        assert_eq!(reopened.state(), BlockState::Completed);
        drop(reopened);

        writer.dispose_free().unwrap();
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        buffer.view().unwrap().fill(0xAB);

        assert!(matches!(
            AppendBlock::open(&buffer),
            Err(LogError::Corrupted(_))
        ));
        pool.return_buffer(&buffer, false).unwrap();
    }

    #[test]
    fn test_dispose_with_reader_fails() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();
        append(&block, 0, b"x").unwrap();

        let cursor = block.cursor().unwrap();
        assert!(block.is_shared());
        let err = block.dispose_free().unwrap_err();
        assert!(err.is_shared());
        assert!(pool.allocator().is_allocated(buffer.reference()).unwrap());

        let (block, _) = err.into_parts();
        assert_eq!(buffer.ref_count(), 2);
        assert_eq!(block.frames().unwrap().count(), 1);

        drop(cursor);
        block.dispose_free().unwrap();
        assert!(pool.allocator().is_in_free_list(buffer.reference()).unwrap());
    }

    #[test]
    fn test_concurrent_claims_commit_in_order() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let buffer = pool.rent(64 * 1024).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, 8, 0).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut done = 0;
                    while done < 100 {
                        let version = block.next_version();
                        if let Claim::Claimed(token) = block.claim(version, 8).unwrap() {
                            token.write(0, &version.to_le_bytes()).unwrap();
                            token.commit().unwrap();
                            done += 1;
                        }
                    }
                });
            }
        });

        assert_eq!(block.len(), 400);
        for (version, payload) in block.frames().unwrap() {
            assert_eq!(payload, &version.to_le_bytes());
        }
        block.dispose_free().unwrap();
    }
}
