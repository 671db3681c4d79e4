//! Reference-to-memory resolution over memory-mapped bucket files.
//!
//! [`SharedBucketStore`] resolves a [`BufferReference`] to the bytes of its
//! bucket. Every process that opens the same directory with the same page
//! and segment sizes sees the same bytes for the same reference.

use crate::allocator::FIRST_SLOT;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::reference::BufferReference;
use crate::region::ClassRegion;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Bucket class storage shared across processes.
pub struct SharedBucketStore {
    dir: PathBuf,
    page_size: usize,
    max_bucket_class: u8,
    max_total_size: usize,
    classes: Box<[ClassRegion]>,
}

impl SharedBucketStore {
    /// Open the store under `config.buckets_path()`.
    ///
    /// Files are created and mapped lazily on first access to each class.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let dir = config.buckets_path();
        std::fs::create_dir_all(&dir)?;

        let classes = (0..=config.max_bucket_class)
            .map(|class| {
                let bucket_size = config.page_size << class;
                let max_slots = config.max_total_size / bucket_size;
                ClassRegion::new(
                    &dir,
                    class,
                    config.page_size,
                    config.segment_size,
                    max_slots,
                )
            })
            .collect();

        Ok(Self {
            dir,
            page_size: config.page_size,
            max_bucket_class: config.max_bucket_class,
            max_total_size: config.max_total_size,
            classes,
        })
    }

    /// Directory holding the bucket files.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Page size (class 0 buffer size).
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest bucket class served.
    pub fn max_bucket_class(&self) -> u8 {
        self.max_bucket_class
    }

    /// Buffer size of a class, or `BucketOutOfRange`.
    pub fn bucket_size(&self, class: u8) -> Result<usize> {
        Ok(self.region(class)?.bucket_size())
    }

    /// Resolve a reference to its bucket, mapping storage on demand.
    ///
    /// Fails with `BucketOutOfRange` for a class above the configured
    /// ceiling, `NotFound` for the null slot, and `NotEnoughSpace` for a
    /// slot the budget could never have produced.
    pub fn get(&self, reference: BufferReference) -> Result<BufferView<'_>> {
        let region = self.region(reference.class())?;

        if reference.slot() < FIRST_SLOT {
            return Err(StoreError::NotFound(reference));
        }

        let (chunk, offset) = region.locate((reference.slot() - FIRST_SLOT) as usize);
        if chunk >= region.max_chunks() {
            return Err(StoreError::NotEnoughSpace {
                requested: region.bucket_size(),
                available: self.available_free_space(),
            });
        }

        let mut base = region.base(chunk);
        if base.is_null() {
            base = region.grow_to(chunk)?;
        }

        // SAFETY: offset + bucket_size lies within the mapped chunk
        Ok(unsafe { BufferView::from_raw_parts(base.add(offset), region.bucket_size()) })
    }

    /// Resolve a reference without validation.
    ///
    /// # Safety
    ///
    /// The reference must have been resolved through [`get`] in this
    /// process before, so its class is in range and its chunk is mapped.
    ///
    /// [`get`]: SharedBucketStore::get
    #[inline]
    pub unsafe fn get_unchecked(&self, reference: BufferReference) -> BufferView<'_> {
        // SAFETY: caller guarantees class is in range and chunk is mapped
        unsafe {
            let region = self.classes.get_unchecked(reference.class() as usize);
            let (chunk, offset) = region.locate((reference.slot() - FIRST_SLOT) as usize);
            let base = region.base_unchecked(chunk);
            debug_assert!(!base.is_null(), "chunk not mapped");
            BufferView::from_raw_parts(base.add(offset), region.bucket_size())
        }
    }

    /// Bytes currently mapped across all classes.
    pub fn mapped_bytes(&self) -> usize {
        self.classes.iter().map(ClassRegion::mapped_bytes).sum()
    }

    /// Remaining capacity before the configured maximum total size.
    pub fn available_free_space(&self) -> usize {
        self.max_total_size.saturating_sub(self.mapped_bytes())
    }

    /// Flush every mapped chunk to its backing file.
    pub fn flush(&self) -> Result<()> {
        for region in self.classes.iter() {
            region.flush()?;
        }
        Ok(())
    }

    fn region(&self, class: u8) -> Result<&ClassRegion> {
        self.classes
            .get(class as usize)
            .ok_or(StoreError::BucketOutOfRange {
                class,
                max: self.max_bucket_class,
            })
    }
}

/// A bounds-checked window onto shared bucket memory.
///
/// The view does not own the memory. Writers are expected to own the
/// bucket by allocation; readers only observe ranges a writer published.
#[derive(Clone, Copy)]
pub struct BufferView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _store: PhantomData<&'a SharedBucketStore>,
}

// SAFETY: the view is a pointer into a shared mapping; synchronization of
// the bytes is the responsibility of the protocol built on top.
unsafe impl Send for BufferView<'_> {}
unsafe impl Sync for BufferView<'_> {}

impl<'a> BufferView<'a> {
    /// Create a view from raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`.
    #[inline]
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self {
            // SAFETY: caller guarantees ptr is valid, hence non-null
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            _store: PhantomData,
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check for a zero-length view.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Narrow the view to `offset..offset + len`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<BufferView<'a>> {
        self.check(offset, len)?;
        // SAFETY: range checked against this view
        Ok(unsafe { BufferView::from_raw_parts(self.as_ptr().add(offset), len) })
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: range checked against this view
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the view starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: range checked against this view
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Set every byte of the view to `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: the whole view is valid for writes
        unsafe { std::ptr::write_bytes(self.as_ptr(), byte, self.len) }
    }

    /// Borrow the bytes as a slice.
    ///
    /// # Safety
    ///
    /// No one may write the range for the lifetime of the slice.
    #[inline]
    pub unsafe fn as_slice(&self) -> &'a [u8] {
        // SAFETY: caller guarantees no concurrent writers
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Borrow the bytes as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the range for the lifetime
    /// of the slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &'a mut [u8] {
        // SAFETY: caller guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(StoreError::InvalidRange {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }
}

impl std::fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
