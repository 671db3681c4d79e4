//! Pooled, reference-counted buffers over the shared bucket store.
//!
//! [`PooledMemoryPool`] is the allocation API. `rent` rounds the request to
//! a bucket class, takes a slot from the [`BucketAllocator`] and returns a
//! [`PooledBuffer`] handle over the slot's memory in the
//! [`SharedBucketStore`].
//!
//! # Handle lifecycle
//!
//! ```text
//!   rent / lookup            retain()            last release()
//!  ---------------> pooled ------------> retained ---------------> disposed
//!                     |                                               |
//!                     | return_buffer (ref_count == 0)                |
//!                     v                                               |
//!                  returned <-----------------------------------------+
//! ```
//!
//! At most one handle object exists per buffer in a process. Handles are
//! registered in a table of weak pointers keyed by storage identity; a
//! handle removes its own entry when the last clone is dropped.
//!
//! The reference count and the lifecycle flags share one atomic word, so
//! retain, release, dispose and return each decide on a single snapshot.

use crate::allocator::{BucketAllocator, SlotEntry};
use crate::bucket::{bucket_size, rounded_length, size_to_class};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::metrics::{HANDLES_LEAKED, HANDLES_LIVE, POOL_RENTS, POOL_RETURNS, PoolStats};
use crate::reference::BufferReference;
use crate::store::{BufferView, SharedBucketStore};
use crate::sync::SpinLock;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

// Handle word layout: [flags 32][ref_count 32]
const REF_MASK: u64 = 0xFFFF_FFFF;
/// Handle is checked out of the pool.
const POOLED: u64 = 1 << 32;
/// Handle was disposed (explicitly or by its last retained view).
const DISPOSED: u64 = 1 << 33;
/// Handle was created by `rent` in this process.
const OWNED: u64 = 1 << 34;

#[inline]
fn refs(word: u64) -> u32 {
    (word & REF_MASK) as u32
}

type HandleTable = HashMap<u64, Weak<BufferInner>, ahash::RandomState>;

struct PoolShared {
    allocator: BucketAllocator,
    store: SharedBucketStore,
    page_size: usize,
    pow2_threshold: usize,
    /// Serializes allocate/free. Handle lookups never take it.
    alloc_lock: SpinLock<()>,
    handles: SpinLock<HandleTable>,
}

impl PoolShared {
    /// Register `inner` as the handle for its buffer.
    ///
    /// Returns the already registered handle instead if one is alive. Any
    /// `Arc` produced while the table is locked is moved out before the
    /// guard drops, since a handle's destructor takes the same lock.
    fn register(&self, inner: Arc<BufferInner>) -> Arc<BufferInner> {
        let key = inner.reference.storage_key();
        let mut handles = self.handles.lock();

        if let Some(existing) = handles.get(&key).and_then(Weak::upgrade) {
            drop(handles);
            drop(inner);
            return existing;
        }

        handles.insert(key, Arc::downgrade(&inner));
        inner
    }

    /// Register the handle of a freshly allocated slot.
    ///
    /// Fails with `InvalidState` while a handle from an earlier allocation
    /// of the slot is still alive in this process.
    fn register_rented(&self, inner: Arc<BufferInner>) -> Result<Arc<BufferInner>> {
        let key = inner.reference.storage_key();
        let mut handles = self.handles.lock();
        let stale = handles.get(&key).and_then(Weak::upgrade);

        if stale.is_none() {
            handles.insert(key, Arc::downgrade(&inner));
            return Ok(inner);
        }

        drop(handles);
        drop(stale);
        // never handed out, so dropping it is not a leak
        inner.state.fetch_and(!POOLED, Ordering::Release);
        drop(inner);
        Err(StoreError::InvalidState(
            "a handle from an earlier allocation of the slot is still live",
        ))
    }

    fn free_slot(&self, reference: BufferReference) -> Result<()> {
        let _guard = self.alloc_lock.lock();
        self.allocator.free(reference)
    }

    fn finish_return(&self, inner: &Arc<BufferInner>) {
        self.unregister(inner.reference, Arc::as_ptr(inner));
        POOL_RETURNS.increment();
        debug!(reference = %inner.reference, "returned buffer");
    }

    fn unregister(&self, reference: BufferReference, target: *const BufferInner) {
        let key = reference.storage_key();
        let mut handles = self.handles.lock();
        if let Some(weak) = handles.get(&key)
            && std::ptr::eq(weak.as_ptr(), target)
        {
            handles.remove(&key);
        }
    }
}

/// Pool of reference-counted buffers backed by the shared bucket store.
///
/// Cloning the pool is cheap; clones share the allocator, store and
/// handle table.
#[derive(Clone)]
pub struct PooledMemoryPool {
    shared: Arc<PoolShared>,
}

impl PooledMemoryPool {
    /// Open the allocator and store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let allocator = BucketAllocator::open(config)?;
        let store = SharedBucketStore::open(config)?;

        Ok(Self {
            shared: Arc::new(PoolShared {
                allocator,
                store,
                page_size: config.page_size,
                pow2_threshold: config.pow2_threshold,
                alloc_lock: SpinLock::new(()),
                handles: SpinLock::new(HashMap::with_hasher(ahash::RandomState::new())),
            }),
        })
    }

    /// Underlying allocator.
    pub fn allocator(&self) -> &BucketAllocator {
        &self.shared.allocator
    }

    /// Underlying bucket store.
    pub fn store(&self) -> &SharedBucketStore {
        &self.shared.store
    }

    /// Page size (class 0 buffer size).
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Requests above this length are rounded to a power of two.
    pub fn pow2_threshold(&self) -> usize {
        self.shared.pow2_threshold
    }

    /// Rent a buffer of at least `requested` bytes.
    ///
    /// The returned handle has a reference count of zero. Fails with
    /// `InvalidState`, leaving the slot free, if a handle from an earlier
    /// allocation of the chosen slot is still held in this process.
    pub fn rent(&self, requested: usize) -> Result<PooledBuffer> {
        let shared = &self.shared;
        let max = shared.allocator.max_bucket_class();

        let class = size_to_class(requested, shared.page_size)
            .ok_or(StoreError::BucketOutOfRange {
                class: u8::MAX,
                max,
            })?;
        let length = rounded_length(requested, shared.page_size, shared.pow2_threshold)
            .ok_or(StoreError::BucketOutOfRange { class, max })?;

        let (reference, from_free_list) = {
            let _guard = shared.alloc_lock.lock();
            shared.allocator.allocate(class)?
        };

        let ptr = match shared.store.get(reference) {
            Ok(view) => view.as_ptr(),
            Err(e) => {
                if let Err(free_err) = shared.free_slot(reference) {
                    warn!(%reference, error = %free_err, "failed to free unmapped bucket");
                }
                return Err(e);
            }
        };

        let inner = BufferInner::new(
            shared.clone(),
            reference,
            ptr,
            requested,
            length,
            bucket_size(class, shared.page_size),
            POOLED | OWNED,
        );
        let inner = match shared.register_rented(inner) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(%reference, "slot still has a live handle from an earlier allocation");
                if let Err(free_err) = shared.free_slot(reference) {
                    warn!(%reference, error = %free_err, "failed to free rented bucket");
                }
                return Err(e);
            }
        };

        POOL_RENTS.increment();
        debug!(%reference, requested, length, from_free_list, "rented buffer");

        Ok(PooledBuffer { inner })
    }

    /// Resolve a reference to this process's handle for it.
    ///
    /// Used for buffers allocated elsewhere, e.g. by another process. The
    /// handle spans the whole bucket. Fails with `NotFound` if the buffer
    /// is not allocated.
    pub fn lookup(&self, reference: BufferReference) -> Result<PooledBuffer> {
        let shared = &self.shared;
        let key = reference.storage_key();

        let cached = shared.handles.lock().get(&key).and_then(Weak::upgrade);
        if let Some(inner) = cached {
            return Ok(PooledBuffer { inner });
        }

        if !shared.allocator.is_allocated(reference)? {
            return Err(StoreError::NotFound(reference));
        }

        let view = shared.store.get(reference)?;
        let reference = BufferReference::from_raw(key);
        let inner = BufferInner::new(
            shared.clone(),
            reference,
            view.as_ptr(),
            view.len(),
            view.len(),
            view.len(),
            POOLED,
        );

        Ok(PooledBuffer {
            inner: shared.register(inner),
        })
    }

    /// Return a buffer's slot to the allocator.
    ///
    /// Only legal while no retained views are outstanding, unless `force`
    /// is set for abnormal teardown. After a successful return the handle
    /// no longer grants access to memory.
    pub fn return_buffer(&self, buffer: &PooledBuffer, force: bool) -> Result<()> {
        let shared = &self.shared;
        let inner = &buffer.inner;

        if !Arc::ptr_eq(&inner.pool, shared) {
            return Err(StoreError::InvalidState("buffer belongs to another pool"));
        }

        // once unpooled no view can be retained, so the count only falls
        let prev = inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & POOLED != 0 && (force || refs(word) == 0)).then_some(word & !POOLED)
            })
            .map_err(|word| {
                if word & POOLED == 0 {
                    StoreError::InvalidState("buffer already returned")
                } else {
                    StoreError::InvalidState("cannot return a retained buffer")
                }
            })?;

        let ref_count = refs(prev);
        if ref_count > 0 {
            warn!(reference = %inner.reference, ref_count, "force returning retained buffer");
        }

        if let Err(e) = shared.free_slot(inner.reference) {
            inner.state.fetch_or(POOLED, Ordering::AcqRel);
            return Err(e);
        }

        inner.state.fetch_or(DISPOSED, Ordering::AcqRel);
        shared.finish_return(inner);
        Ok(())
    }

    /// Release `view` and return its buffer in one step.
    ///
    /// Succeeds only if `view` holds the buffer's last reference, so no
    /// reader can retain the buffer between the release and the return. On
    /// failure the view is handed back still retained.
    pub fn return_retained(
        &self,
        mut view: RetainedView,
    ) -> std::result::Result<(), (RetainedView, StoreError)> {
        let shared = &self.shared;
        let inner = view.buffer.inner.clone();

        if !Arc::ptr_eq(&inner.pool, shared) {
            return Err((view, StoreError::InvalidState("buffer belongs to another pool")));
        }

        let updated = inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & (POOLED | DISPOSED) == POOLED && refs(word) == 1)
                    .then_some((word & !(POOLED | REF_MASK)) | DISPOSED)
            });
        let prev = match updated {
            Ok(prev) => prev,
            Err(word) if word & POOLED == 0 => {
                return Err((view, StoreError::InvalidState("buffer already returned")));
            }
            Err(word) => {
                let ref_count = refs(word).saturating_sub(1);
                return Err((view, StoreError::StillRetained { ref_count }));
            }
        };

        if let Err(e) = shared.free_slot(inner.reference) {
            // unpooled and unreferenced: nothing else could change the word
            inner.state.store(prev, Ordering::Release);
            return Err((view, e));
        }

        view.released = true;
        drop(view);
        shared.finish_return(&inner);
        Ok(())
    }

    /// Number of live handles registered in this process.
    pub fn live_handles(&self) -> usize {
        self.shared.handles.lock().len()
    }

    /// Snapshot of allocator and store usage.
    pub fn stats(&self) -> Result<PoolStats> {
        Ok(PoolStats {
            classes: self.shared.allocator.stats()?,
            max_total_size: self.shared.allocator.max_total_size(),
            mapped_bytes: self.shared.store.mapped_bytes(),
            live_handles: self.live_handles(),
        })
    }

    /// Write a listing of slots, see [`BucketAllocator::print`].
    pub fn print<W: Write>(
        &self,
        out: &mut W,
        class: Option<u8>,
        formatter: Option<&dyn Fn(&SlotEntry) -> String>,
    ) -> Result<()> {
        self.shared.allocator.print(out, class, formatter)
    }
}

/// Builder for creating a PooledMemoryPool.
pub struct PooledMemoryPoolBuilder {
    config: StoreConfig,
}

impl PooledMemoryPoolBuilder {
    /// Create a new builder rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            config: StoreConfig::new(path),
        }
    }

    /// Build from store config.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Set the page size in bytes (default: 4KB).
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the maximum total size in bytes (default: 1GB).
    pub fn max_total_size(mut self, size: usize) -> Self {
        self.config.max_total_size = size;
        self
    }

    /// Set the pow2 rounding threshold in bytes (default: 64KB).
    pub fn pow2_threshold(mut self, size: usize) -> Self {
        self.config.pow2_threshold = size;
        self
    }

    /// Set the mapping growth granularity in bytes (default: 1MB).
    pub fn segment_size(mut self, size: usize) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the largest bucket class served (default: 16).
    pub fn max_bucket_class(mut self, class: u8) -> Self {
        self.config.max_bucket_class = class;
        self
    }

    /// Set the writer-process identity (default: OS process id).
    pub fn wpid(mut self, wpid: u64) -> Self {
        self.config.wpid = Some(wpid);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<PooledMemoryPool> {
        PooledMemoryPool::open(&self.config)
    }
}

struct BufferInner {
    pool: Arc<PoolShared>,
    reference: BufferReference,
    ptr: NonNull<u8>,
    requested: usize,
    length: usize,
    length_pow2: usize,
    /// Flags and reference count, see `REF_MASK`.
    state: AtomicU64,
}

// SAFETY: `ptr` points into a mapping owned by `pool`, which this handle
// keeps alive. Mutable state is atomic.
unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

impl BufferInner {
    fn new(
        pool: Arc<PoolShared>,
        reference: BufferReference,
        ptr: *mut u8,
        requested: usize,
        length: usize,
        length_pow2: usize,
        flags: u64,
    ) -> Arc<Self> {
        debug_assert!(requested <= length && length <= length_pow2);
        HANDLES_LIVE.increment();
        Arc::new(Self {
            pool,
            reference,
            // SAFETY: store views are never null
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            requested,
            length,
            length_pow2,
            state: AtomicU64::new(flags),
        })
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        HANDLES_LIVE.decrement();

        let word = *self.state.get_mut();
        if word & (POOLED | OWNED) == POOLED | OWNED {
            HANDLES_LEAKED.increment();
            warn!(reference = %self.reference, "buffer handle dropped without being returned");
        }

        self.pool.unregister(self.reference, self);
    }
}

/// Handle to a pooled buffer.
///
/// Clones refer to the same handle object.
#[derive(Clone)]
pub struct PooledBuffer {
    inner: Arc<BufferInner>,
}

impl PooledBuffer {
    /// Reference naming the buffer's storage.
    #[inline]
    pub fn reference(&self) -> BufferReference {
        self.inner.reference
    }

    /// Length originally requested.
    #[inline]
    pub fn requested_len(&self) -> usize {
        self.inner.requested
    }

    /// Usable length: page-aligned, or a power of two above the threshold.
    #[inline]
    pub fn length(&self) -> usize {
        self.inner.length
    }

    /// Capacity of the underlying bucket.
    #[inline]
    pub fn length_pow2(&self) -> usize {
        self.inner.length_pow2
    }

    /// Outstanding retained views.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        refs(self.inner.state.load(Ordering::Acquire))
    }

    /// Check whether the buffer is still checked out of the pool.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) & POOLED != 0
    }

    /// Check whether any retained view is outstanding.
    #[inline]
    pub fn is_retained(&self) -> bool {
        self.ref_count() > 0
    }

    /// Check whether the buffer has been disposed.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) & DISPOSED != 0
    }

    /// The pool this buffer was rented from.
    pub fn pool(&self) -> PooledMemoryPool {
        PooledMemoryPool {
            shared: self.inner.pool.clone(),
        }
    }

    /// Check whether two handles are the same object.
    #[inline]
    pub fn ptr_eq(a: &PooledBuffer, b: &PooledBuffer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// View of the usable bytes.
    ///
    /// Fails once the buffer was returned, since the slot may already
    /// belong to another renter.
    pub fn view(&self) -> Result<BufferView<'_>> {
        if !self.is_pooled() {
            return Err(StoreError::InvalidState("buffer was returned to the pool"));
        }
        // SAFETY: the mapping outlives `self.inner.pool`
        Ok(unsafe { BufferView::from_raw_parts(self.inner.ptr.as_ptr(), self.inner.length) })
    }

    /// Retain the whole buffer.
    pub fn retain(&self) -> Result<RetainedView> {
        self.retain_range(0, self.length())
    }

    /// Retain `offset..offset + len` as an independent view.
    ///
    /// Each view holds one reference; the last release disposes the
    /// buffer. Fails with `AlreadyDisposed` on a disposed or returned
    /// buffer.
    pub fn retain_range(&self, offset: usize, len: usize) -> Result<RetainedView> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length() => {}
            _ => {
                return Err(StoreError::InvalidRange {
                    offset,
                    len,
                    capacity: self.length(),
                });
            }
        }

        self.inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & (POOLED | DISPOSED) == POOLED && refs(word) < u32::MAX).then_some(word + 1)
            })
            .map_err(|word| {
                if word & (POOLED | DISPOSED) == POOLED {
                    StoreError::InvalidState("too many retained views")
                } else {
                    StoreError::AlreadyDisposed
                }
            })?;

        Ok(RetainedView {
            buffer: self.clone(),
            offset,
            len,
            released: false,
        })
    }

    /// Dispose the buffer.
    ///
    /// Fails with `StillRetained` while views are outstanding and with
    /// `AlreadyDisposed` the second time.
    pub fn dispose(&self) -> Result<()> {
        self.inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (refs(word) == 0 && word & DISPOSED == 0).then_some(word | DISPOSED)
            })
            .map_err(|word| match refs(word) {
                0 => StoreError::AlreadyDisposed,
                ref_count => StoreError::StillRetained { ref_count },
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("reference", &self.reference())
            .field("length", &self.length())
            .field("length_pow2", &self.length_pow2())
            .field("ref_count", &self.ref_count())
            .field("pooled", &self.is_pooled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A retained range of a pooled buffer.
///
/// Releasing the view, explicitly or by dropping it, gives back its
/// reference.
pub struct RetainedView {
    buffer: PooledBuffer,
    offset: usize,
    len: usize,
    released: bool,
}

impl RetainedView {
    /// The buffer this view retains.
    pub fn buffer(&self) -> &PooledBuffer {
        &self.buffer
    }

    /// Offset of the view within the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check for a zero-length view.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of the retained range.
    ///
    /// Stays valid until release, because a retained buffer cannot be
    /// returned without `force`.
    pub fn view(&self) -> BufferView<'_> {
        // SAFETY: offset + len was checked against the buffer length
        unsafe {
            BufferView::from_raw_parts(self.buffer.inner.ptr.as_ptr().add(self.offset), self.len)
        }
    }

    /// Retain a sub-range of this view as another independent view.
    pub fn retain_range(&self, offset: usize, len: usize) -> Result<RetainedView> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => self.buffer.retain_range(self.offset + offset, len),
            _ => Err(StoreError::InvalidRange {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }

    /// Release the view.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        let released = self
            .buffer
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| match refs(word) {
                0 => None,
                1 => Some((word - 1) | DISPOSED),
                _ => Some(word - 1),
            });
        debug_assert!(released.is_ok(), "released more views than were retained");
    }
}

impl Drop for RetainedView {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for RetainedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainedView")
            .field("reference", &self.buffer.reference())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
