//! Address-free buffer references.
//!
//! A [`BufferReference`] names a pooled buffer by bucket class and slot
//! index. It carries no pointer, so it can be persisted in the allocation
//! index or handed to another process that maps the same bucket files.

use std::fmt;

/// Largest bucket class representable by any store.
pub const MAX_BUCKET_CLASS: u8 = 31;

/// Packed identifier of a pooled buffer.
///
/// ```text
/// +-----------+------+---------+--------------------+
/// |  63..41   |  40  | 39..32  |       31..0        |
/// |  unused   | flag |  class  |     slot index     |
/// +-----------+------+---------+--------------------+
/// ```
///
/// Equality and hashing cover all three fields. Two references that differ
/// only in the flag name the same storage (see [`storage_key`]) but are
/// distinct identities, used for protocol-level tagging.
///
/// Slot index 0 is never allocated, so the all-zero value is [`NONE`].
///
/// [`storage_key`]: BufferReference::storage_key
/// [`NONE`]: BufferReference::NONE
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BufferReference(u64);

impl BufferReference {
    const SLOT_MASK: u64 = 0xFFFF_FFFF;
    const CLASS_SHIFT: u32 = 32;
    const CLASS_MASK: u64 = 0xFF;
    const FLAG_BIT: u64 = 1 << 40;
    const RAW_MASK: u64 = Self::FLAG_BIT | (Self::CLASS_MASK << Self::CLASS_SHIFT) | Self::SLOT_MASK;

    /// The null reference.
    pub const NONE: Self = Self(0);

    /// Create a reference with the flag cleared.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `class > MAX_BUCKET_CLASS`.
    #[inline]
    pub fn new(class: u8, slot: u32) -> Self {
        debug_assert!(class <= MAX_BUCKET_CLASS, "bucket class exceeds 5 bits");
        Self(((class as u64) << Self::CLASS_SHIFT) | slot as u64)
    }

    /// Return a copy with the flag bit set or cleared.
    #[inline]
    pub fn with_flag(self, flag: bool) -> Self {
        if flag {
            Self(self.0 | Self::FLAG_BIT)
        } else {
            Self(self.0 & !Self::FLAG_BIT)
        }
    }

    /// Bucket class.
    #[inline]
    pub fn class(&self) -> u8 {
        ((self.0 >> Self::CLASS_SHIFT) & Self::CLASS_MASK) as u8
    }

    /// Slot index within the class.
    #[inline]
    pub fn slot(&self) -> u32 {
        (self.0 & Self::SLOT_MASK) as u32
    }

    /// The reserved tag bit.
    #[inline]
    pub fn flag(&self) -> bool {
        self.0 & Self::FLAG_BIT != 0
    }

    /// Packed value.
    #[inline]
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Construct from a packed value, discarding unused bits.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw & Self::RAW_MASK)
    }

    /// Identity of the underlying storage, ignoring the flag.
    ///
    /// Keys sort by class first, then slot, so a range scan over one class
    /// visits slots in ascending order.
    #[inline]
    pub fn storage_key(&self) -> u64 {
        self.0 & !Self::FLAG_BIT
    }

    /// Check for the null reference.
    #[inline]
    pub fn is_none(&self) -> bool {
        self.storage_key() == 0
    }
}

impl fmt::Debug for BufferReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "BufferReference::NONE");
        }
        f.debug_struct("BufferReference")
            .field("class", &self.class())
            .field("slot", &self.slot())
            .field("flag", &self.flag())
            .finish()
    }
}

impl fmt::Display for BufferReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class(), self.slot())?;
        if self.flag() {
            write!(f, "*")?;
        }
        Ok(())
    }
}
