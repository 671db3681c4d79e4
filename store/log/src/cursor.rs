//! Readers over live and archived blocks.

use crate::block::{
    BLOCK_MAGIC, FIRST_VERSION_OFFSET, FRAME_PREFIX, HEADER_SIZE, SKIPPED_FRAME, committed_data,
    committed_word, frame_len, state_byte, unpack_committed,
};
use crate::error::{LogError, Result};
use crate::state::BlockState;
use std::sync::atomic::Ordering;
use store_core::{BufferReference, PooledBuffer, RetainedView};

/// Decode the frame at the start of `data`.
///
/// Returns the payload, or `None` for a skipped frame, and the frame length.
fn decode_frame(data: &[u8]) -> Option<(Option<&[u8]>, usize)> {
    let prefix = data.get(..FRAME_PREFIX)?;
    let raw = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let len = (raw & !SKIPPED_FRAME) as usize;

    let frame = frame_len(len);
    if frame > data.len() {
        return None;
    }

    let payload = (raw & SKIPPED_FRAME == 0).then(|| &data[FRAME_PREFIX..FRAME_PREFIX + len]);
    Some((payload, frame))
}

/// Iterator over `(version, payload)` entries of committed frame bytes.
///
/// Skipped frames use up their version but are not yielded. Stops early if
/// a frame runs past the end of the data.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    data: &'a [u8],
    version: u64,
    remaining: u32,
}

impl<'a> Frames<'a> {
    /// Decode `count` frames from `data`, starting at `first_version`.
    pub fn new(data: &'a [u8], first_version: u64, count: u32) -> Self {
        Self {
            data,
            version: first_version,
            remaining: count,
        }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let Some((payload, frame)) = decode_frame(self.data) else {
                self.remaining = 0;
                return None;
            };

            let version = self.version;
            self.data = &self.data[frame..];
            self.version += 1;
            self.remaining -= 1;

            if let Some(payload) = payload {
                return Some((version, payload));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// A reader attached to a live block.
///
/// The cursor retains the block's buffer, so the buffer cannot be returned
/// to the pool while the cursor exists. Entries become visible as the
/// writer commits them.
pub struct BlockCursor {
    view: RetainedView,
    first_version: u64,
    next_index: u32,
    next_offset: u32,
}

impl BlockCursor {
    /// Attach to the block initialized in `buffer`.
    pub fn attach(buffer: &PooledBuffer) -> Result<Self> {
        let mut header = [0u8; FIRST_VERSION_OFFSET + 8];
        buffer.view()?.read(0, &mut header)?;
        if header[..8] != BLOCK_MAGIC {
            return Err(LogError::Corrupted("bad block magic"));
        }

        let mut first_version = [0u8; 8];
        first_version.copy_from_slice(&header[FIRST_VERSION_OFFSET..]);
        let view = buffer.retain()?;

        Ok(Self {
            view,
            first_version: u64::from_le_bytes(first_version),
            next_index: 0,
            next_offset: 0,
        })
    }

    /// Reference of the block's buffer.
    pub fn reference(&self) -> BufferReference {
        self.view.buffer().reference()
    }

    /// Version of the next entry this cursor returns.
    pub fn position(&self) -> u64 {
        self.first_version + self.next_index as u64
    }

    /// Entries and data bytes published by the writer.
    pub fn committed(&self) -> (u32, u32) {
        unpack_committed(committed_word(&self.view.view()).load(Ordering::Acquire))
    }

    /// Check whether the writer completed the block.
    ///
    /// A completed block may still receive commits for claims made before
    /// completion.
    pub fn is_completed(&self) -> bool {
        state_byte(&self.view.view()).load(Ordering::Acquire) == BlockState::Completed as u8
    }

    /// Return the next committed entry, if any. Skipped frames are passed over.
    pub fn next_entry(&mut self) -> Result<Option<(u64, &[u8])>> {
        let (count, offset) = self.committed();
        let data = committed_data(&self.view.view(), offset)?;

        while self.next_index < count {
            let Some((payload, frame)) = decode_frame(&data[self.next_offset as usize..]) else {
                return Ok(None);
            };

            let version = self.first_version + self.next_index as u64;
            self.next_index += 1;
            self.next_offset += frame as u32;

            if let Some(payload) = payload {
                return Ok(Some((version, payload)));
            }
        }
        Ok(None)
    }

    /// Iterate every entry committed so far, from the start of the block.
    pub fn frames(&self) -> Result<Frames<'_>> {
        let (count, offset) = self.committed();
        let data = committed_data(&self.view.view(), offset)?;
        Ok(Frames::new(data, self.first_version, count))
    }

    /// Total bytes of header and committed frames.
    pub fn committed_len(&self) -> usize {
        HEADER_SIZE + self.committed().1 as usize
    }

    /// Detach from the block.
    pub fn release(self) {
        self.view.release();
    }
}

impl std::fmt::Debug for BlockCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCursor")
            .field("reference", &self.reference())
            .field("position", &self.position())
            .field("committed", &self.committed())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::block::{AppendBlock, Claim};
    use store_core::PooledMemoryPoolBuilder;
    use tempfile::TempDir;

    fn encode(entries: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for entry in entries {
            data.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            data.extend_from_slice(entry);
            data.resize(data.len().next_multiple_of(8), 0);
        }
        data
    }

    #[test]
    fn test_frames_decode() {
        let data = encode(&[b"alpha", b"", b"a longer payload"]);
        let frames: Vec<_> = Frames::new(&data, 10, 3).collect();
        assert_eq!(
            frames,
            vec![(10, &b"alpha"[..]), (11, &b""[..]), (12, &b"a longer payload"[..])]
        );
    }

    #[test]
    fn test_frames_respects_count() {
        let data = encode(&[b"a", b"b", b"c"]);
        assert_eq!(Frames::new(&data, 0, 2).count(), 2);
    }

    #[test]
    fn test_frames_truncated() {
        let mut data = encode(&[b"ok", b"truncated payload"]);
        data.truncate(20);
        let frames: Vec<_> = Frames::new(&data, 0, 2).collect();
        assert_eq!(frames, vec![(0, &b"ok"[..])]);
    }

    #[test]
    fn test_frames_pass_over_skipped() {
        let mut data = encode(&[b"kept", b"gone", b"also kept"]);
        data[8..12].copy_from_slice(&(SKIPPED_FRAME | 4).to_le_bytes());

        let frames: Vec<_> = Frames::new(&data, 5, 3).collect();
        assert_eq!(frames, vec![(5, &b"kept"[..]), (7, &b"also kept"[..])]);
    }

    #[test]
    fn test_cursor_passes_over_abandoned_claim() {
        let dir = TempDir::new().unwrap();
        let pool = PooledMemoryPoolBuilder::new(dir.path())
            .max_total_size(1 << 20)
            .segment_size(64 * 1024)
            .wpid(1)
            .build()
            .unwrap();
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 9, -1, 0).unwrap();
        let mut cursor = block.cursor().unwrap();

        let Claim::Claimed(abandoned) = block.claim(0, 6).unwrap() else {
            panic!("expected claim");
        };
        let Claim::Claimed(kept) = block.claim(1, 4).unwrap() else {
            panic!("expected claim");
        };
        drop(abandoned);
        kept.write(0, b"kept").unwrap();
        kept.commit().unwrap();

        assert_eq!(cursor.next_entry().unwrap(), Some((1, &b"kept"[..])));
        assert!(cursor.next_entry().unwrap().is_none());
        assert_eq!(cursor.position(), 2);

        cursor.release();
        block.dispose_free().unwrap();
    }

    #[test]
    fn test_cursor_follows_commits() {
        let dir = TempDir::new().unwrap();
        let pool = PooledMemoryPoolBuilder::new(dir.path())
            .max_total_size(1 << 20)
            .segment_size(64 * 1024)
            .wpid(1)
            .build()
            .unwrap();
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 9, -1, 20).unwrap();

        let mut cursor = block.cursor().unwrap();
        assert_eq!(cursor.position(), 20);
        assert!(cursor.next_entry().unwrap().is_none());

        let Claim::Claimed(token) = block.claim(20, 3).unwrap() else {
            panic!("expected claim");
        };
        token.write(0, b"one").unwrap();
        assert!(cursor.next_entry().unwrap().is_none());
        token.commit().unwrap();

        assert_eq!(cursor.next_entry().unwrap(), Some((20, &b"one"[..])));
        assert!(cursor.next_entry().unwrap().is_none());
        assert!(!cursor.is_completed());

        block.complete();
        assert!(cursor.is_completed());
        assert_eq!(cursor.frames().unwrap().count(), 1);
        assert_eq!(cursor.committed_len(), HEADER_SIZE + 8);

        cursor.release();
        block.dispose_free().unwrap();
    }
}
