//! Bucket size classes.
//!
//! Class 0 holds one page; every following class doubles the buffer size.
//! The pooled length handed to callers is rounded separately (see
//! [`rounded_length`]): page-aligned up to the pow2 threshold, a power of
//! two above it.

use crate::reference::MAX_BUCKET_CLASS;

/// Default page size (4KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Buffer size of a bucket class.
#[inline]
pub fn bucket_size(class: u8, page_size: usize) -> usize {
    page_size << class
}

/// Find the smallest bucket class whose buffers hold `len` bytes.
///
/// Returns `None` if `len` is too large for any representable class.
#[inline]
pub fn size_to_class(len: usize, page_size: usize) -> Option<u8> {
    let pages = len.max(1).div_ceil(page_size);
    let class = pages.checked_next_power_of_two()?.trailing_zeros();
    if class > MAX_BUCKET_CLASS as u32 {
        None
    } else {
        Some(class as u8)
    }
}

/// Length exposed for a request of `len` bytes.
///
/// At or below `pow2_threshold` the length grows linearly by pages. Above
/// it the length is the next power of two, which is also the bucket size.
#[inline]
pub fn rounded_length(len: usize, page_size: usize, pow2_threshold: usize) -> Option<usize> {
    let len = len.max(1);
    if len > pow2_threshold {
        len.checked_next_power_of_two().map(|n| n.max(page_size))
    } else {
        len.div_ceil(page_size).checked_mul(page_size)
    }
}
