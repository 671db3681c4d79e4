//! Block state machine and the packed claim tail.
//!
//! The claim path reserves space and a version with a single CAS on a
//! packed word holding the block state, the number of entries claimed and
//! the bytes claimed. Completing the block flips the state in the same
//! word, so a claim can never slip in after completion.

use store_core::sync::{AtomicU64, CasRetryConfig, Ordering, spin_loop};

/// Largest number of entries a block can hold (24-bit count).
pub const MAX_ENTRIES: u32 = 0xFF_FFFF;

/// State of an append block.
///
/// # State Transition Diagram
///
/// ```text
///   +---------+  initialize()  +----------+  complete()  +-----------+
///   |  Empty  |--------------->| Writable |------------->| Completed |
///   +---------+                +----------+              +-----------+
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Uninitialized memory.
    Empty = 0,
    /// Accepting claims.
    Writable = 1,
    /// No more claims; contents are immutable.
    Completed = 2,
}

impl BlockState {
    /// Convert from raw u8 value.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockState::Empty),
            1 => Some(BlockState::Writable),
            2 => Some(BlockState::Completed),
            _ => None,
        }
    }

    /// Check if the block accepts claims.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, BlockState::Writable)
    }
}

/// Packed claim tail of a block.
///
/// Layout: `[8 bits state][24 bits count][32 bits offset]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    /// Current state.
    pub state: BlockState,
    /// Entries claimed.
    pub count: u32,
    /// Bytes claimed in the data area.
    pub offset: u32,
}

impl Tail {
    const COUNT_SHIFT: u64 = 32;
    const STATE_SHIFT: u64 = 56;

    /// Pack into a u64.
    #[inline]
    pub fn pack(self) -> u64 {
        ((self.state as u64) << Self::STATE_SHIFT)
            | (((self.count & MAX_ENTRIES) as u64) << Self::COUNT_SHIFT)
            | self.offset as u64
    }

    /// Unpack from a u64. Unknown state bytes read as `Completed`.
    #[inline]
    pub fn unpack(packed: u64) -> Self {
        let state = BlockState::from_u8((packed >> Self::STATE_SHIFT) as u8)
            .unwrap_or(BlockState::Completed);
        Self {
            state,
            count: ((packed >> Self::COUNT_SHIFT) as u32) & MAX_ENTRIES,
            offset: packed as u32,
        }
    }
}

/// Outcome of reserving space on the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reserve {
    /// Space reserved for entry `index` at data offset `offset`.
    Reserved { index: u32, offset: u32 },
    /// Not enough space left.
    Full,
    /// `version` was not the next expected one.
    OutOfOrder { expected: u64 },
    /// Block is not writable.
    NotWritable,
    /// Lost the CAS too many times.
    Contended { attempts: u32 },
}

/// Atomic cell holding a packed [`Tail`].
pub(crate) struct TailCell {
    word: AtomicU64,
}

impl TailCell {
    pub(crate) fn new(tail: Tail) -> Self {
        Self {
            word: AtomicU64::new(tail.pack()),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> Tail {
        Tail::unpack(self.word.load(Ordering::Acquire))
    }

    /// Reserve `frame_len` bytes for `version`.
    pub(crate) fn reserve(
        &self,
        first_version: u64,
        version: u64,
        frame_len: u32,
        capacity: u32,
    ) -> Reserve {
        let config = CasRetryConfig::default();
        let mut attempts = 0;

        loop {
            let packed = self.word.load(Ordering::Acquire);
            let current = Tail::unpack(packed);

            if !current.state.is_writable() {
                return Reserve::NotWritable;
            }

            let expected = first_version + current.count as u64;
            if version != expected {
                return Reserve::OutOfOrder { expected };
            }

            let new_offset = match current.offset.checked_add(frame_len) {
                Some(end) if end <= capacity && current.count < MAX_ENTRIES => end,
                _ => return Reserve::Full,
            };

            let next = Tail {
                state: current.state,
                count: current.count + 1,
                offset: new_offset,
            };

            match self.word.compare_exchange(
                packed,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Reserve::Reserved {
                        index: current.count,
                        offset: current.offset,
                    };
                }
                Err(_) => {
                    attempts += 1;
                    if attempts >= config.max_attempts {
                        return Reserve::Contended { attempts };
                    }
                    spin_loop();
                }
            }
        }
    }

    /// Undo the reservation of entry `index` if it is still the newest.
    ///
    /// Returns false once a later reservation exists.
    pub(crate) fn rollback(&self, index: u32, offset: u32, frame_len: u32) -> bool {
        let mut packed = self.word.load(Ordering::Acquire);
        loop {
            let current = Tail::unpack(packed);
            if current.count != index + 1 || current.offset != offset + frame_len {
                return false;
            }

            let prev = Tail {
                count: index,
                offset,
                ..current
            };

            match self.word.compare_exchange_weak(
                packed,
                prev.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => packed = actual,
            }
        }
    }

    /// Move to `Completed`. Returns false if already completed.
    pub(crate) fn complete(&self) -> bool {
        let mut packed = self.word.load(Ordering::Acquire);
        loop {
            let current = Tail::unpack(packed);
            if current.state == BlockState::Completed {
                return false;
            }

            let next = Tail {
                state: BlockState::Completed,
                ..current
            };

            match self.word.compare_exchange_weak(
                packed,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => packed = actual,
            }
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn writable() -> TailCell {
        TailCell::new(Tail {
            state: BlockState::Writable,
            count: 0,
            offset: 0,
        })
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(BlockState::from_u8(1), Some(BlockState::Writable));
        assert_eq!(BlockState::from_u8(9), None);
        assert!(!BlockState::Completed.is_writable());
    }

    #[test]
    fn test_tail_pack_unpack() {
        let tail = Tail {
            state: BlockState::Writable,
            count: MAX_ENTRIES,
            offset: u32::MAX,
        };
        assert_eq!(Tail::unpack(tail.pack()), tail);

        let garbage = Tail::unpack(0xFF << 56);
        assert_eq!(garbage.state, BlockState::Completed);
    }

    #[test]
    fn test_reserve_in_order() {
        let cell = writable();
        assert_eq!(
            cell.reserve(10, 10, 16, 64),
            Reserve::Reserved {
                index: 0,
                offset: 0
            }
        );
        assert_eq!(
            cell.reserve(10, 11, 16, 64),
            Reserve::Reserved {
                index: 1,
                offset: 16
            }
        );
        assert_eq!(
            cell.reserve(10, 13, 16, 64),
            Reserve::OutOfOrder { expected: 12 }
        );
        assert_eq!(cell.load().count, 2);
    }

    #[test]
    fn test_reserve_full_leaves_tail() {
        let cell = writable();
        assert!(matches!(cell.reserve(0, 0, 48, 64), Reserve::Reserved { .. }));
        assert_eq!(cell.reserve(0, 1, 24, 64), Reserve::Full);
        assert_eq!(cell.load().offset, 48);
        assert!(matches!(cell.reserve(0, 1, 16, 64), Reserve::Reserved { .. }));
    }

    #[test]
    fn test_rollback_newest_only() {
        let cell = writable();
        assert!(matches!(cell.reserve(0, 0, 16, 64), Reserve::Reserved { .. }));
        assert!(matches!(cell.reserve(0, 1, 8, 64), Reserve::Reserved { .. }));

        assert!(!cell.rollback(0, 0, 16));
        assert!(cell.rollback(1, 16, 8));
        assert_eq!((cell.load().count, cell.load().offset), (1, 16));
        assert!(!cell.rollback(1, 16, 8));

        assert!(cell.rollback(0, 0, 16));
        assert_eq!(
            cell.reserve(0, 0, 24, 64),
            Reserve::Reserved {
                index: 0,
                offset: 0
            }
        );
    }

    #[test]
    fn test_complete_blocks_reserve() {
        let cell = writable();
        assert!(cell.complete());
        assert!(!cell.complete());
        assert_eq!(cell.reserve(0, 0, 8, 64), Reserve::NotWritable);

        let empty = TailCell::new(Tail {
            state: BlockState::Empty,
            count: 0,
            offset: 0,
        });
        assert_eq!(empty.reserve(0, 0, 8, 64), Reserve::NotWritable);
    }
}
