//! Growable memory-mapped region backing one bucket class.
//!
//! Each class owns a single file. Growth extends the file by whole chunks
//! and maps only the new chunk, so addresses handed out earlier never move.
//!
//! # File Layout
//!
//! ```text
//! +------------------+
//! | BucketFileHeader |  one page (64 bytes used)
//! +------------------+
//! | Chunk 0          |  chunk_size bytes = slots 1..=n
//! | Chunk 1          |  chunk_size bytes
//! | ...              |
//! +------------------+
//! ```
//!
//! Base addresses of mapped chunks are published in an array of atomic
//! pointers, which is the process-local table that resolves a slot index
//! to memory. Chunks are always mapped in order, so `mapped` is a prefix
//! length.

use crate::metrics::MAPPED_BYTES;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use tracing::debug;

/// Magic bytes identifying a bucket class file.
pub const FILE_MAGIC: [u8; 8] = *b"BKTCLASS";

/// Current file format version.
pub const FILE_VERSION: u32 = 1;

/// Bytes of the header actually used.
pub const HEADER_SIZE: usize = 64;

/// Header stored at the beginning of each bucket class file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketFileHeader {
    /// File format version.
    pub version: u32,
    /// Bucket class stored in this file.
    pub class: u8,
    /// Page size the store was created with.
    pub page_size: u32,
    /// Buffer size of the class.
    pub bucket_size: u64,
    /// Growth granularity.
    pub chunk_size: u64,
}

impl BucketFileHeader {
    /// Validate that the header matches the expected layout.
    pub fn validate(&self, expected: &BucketFileHeader) -> io::Result<()> {
        if self.version != FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Unsupported bucket file version {} (expected {})",
                    self.version, FILE_VERSION
                ),
            ));
        }
        if self != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Bucket file layout mismatch: file has {:?} but config has {:?}",
                    self, expected
                ),
            ));
        }
        Ok(())
    }

    /// Read a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "File too small to contain header",
            ));
        }
        if bytes[0..8] != FILE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes in bucket file",
            ));
        }

        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        Ok(Self {
            version: u32_at(8),
            class: bytes[12],
            page_size: u32_at(16),
            bucket_size: u64_at(24),
            chunk_size: u64_at(32),
        })
    }

    /// Write the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&FILE_MAGIC);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12] = self.class;
        bytes[16..20].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.bucket_size.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.chunk_size.to_le_bytes());
        bytes
    }
}

struct RegionFile {
    file: Option<File>,
    maps: Vec<MmapMut>,
}

/// Memory-mapped storage for one bucket class.
pub(crate) struct ClassRegion {
    path: PathBuf,
    header: BucketFileHeader,
    page_size: usize,
    bucket_size: usize,
    chunk_size: usize,
    slots_per_chunk: usize,
    bases: Box<[AtomicPtr<u8>]>,
    mapped: AtomicU32,
    inner: Mutex<RegionFile>,
}

// SAFETY: `bases` only publishes pointers into mappings owned by `inner`,
// which are never unmapped before the region is dropped.
unsafe impl Send for ClassRegion {}
unsafe impl Sync for ClassRegion {}

impl ClassRegion {
    /// Describe the region for `class` without touching the filesystem.
    ///
    /// `max_slots` bounds the slot index (exclusive of the reserved slot 0)
    /// the budget can ever produce for this class.
    pub(crate) fn new(
        dir: &Path,
        class: u8,
        page_size: usize,
        segment_size: usize,
        max_slots: usize,
    ) -> Self {
        let bucket_size = page_size << class;
        let chunk_size = bucket_size.max(segment_size);
        let slots_per_chunk = chunk_size / bucket_size;
        let max_chunks = max_slots.div_ceil(slots_per_chunk).max(1);

        let bases = (0..max_chunks)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();

        Self {
            path: dir.join(format!("class-{:02}.bkt", class)),
            header: BucketFileHeader {
                version: FILE_VERSION,
                class,
                page_size: page_size as u32,
                bucket_size: bucket_size as u64,
                chunk_size: chunk_size as u64,
            },
            page_size,
            bucket_size,
            chunk_size,
            slots_per_chunk,
            bases,
            mapped: AtomicU32::new(0),
            inner: Mutex::new(RegionFile {
                file: None,
                maps: Vec::new(),
            }),
        }
    }

    #[inline]
    pub(crate) fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Split a zero-based slot position into (chunk, byte offset).
    #[inline]
    pub(crate) fn locate(&self, index: usize) -> (usize, usize) {
        (
            index / self.slots_per_chunk,
            (index % self.slots_per_chunk) * self.bucket_size,
        )
    }

    #[inline]
    pub(crate) fn max_chunks(&self) -> usize {
        self.bases.len()
    }

    pub(crate) fn mapped_bytes(&self) -> usize {
        self.mapped.load(Ordering::Acquire) as usize * self.chunk_size
    }

    /// Base address of a mapped chunk, or null if not yet mapped here.
    #[inline]
    pub(crate) fn base(&self, chunk: usize) -> *mut u8 {
        if chunk < self.mapped.load(Ordering::Acquire) as usize {
            self.bases[chunk].load(Ordering::Acquire)
        } else {
            std::ptr::null_mut()
        }
    }

    /// Base address of a chunk without checking that it is mapped.
    ///
    /// # Safety
    ///
    /// `chunk` must be below `max_chunks()` and already mapped.
    #[inline]
    pub(crate) unsafe fn base_unchecked(&self, chunk: usize) -> *mut u8 {
        // SAFETY: caller guarantees chunk is in bounds
        unsafe { self.bases.get_unchecked(chunk) }.load(Ordering::Acquire)
    }

    /// Map chunks up to and including `chunk`, extending the file as needed.
    pub(crate) fn grow_to(&self, chunk: usize) -> io::Result<*mut u8> {
        let mut inner = self.inner.lock();

        // Another thread may have mapped it while we waited
        let mapped = self.mapped.load(Ordering::Acquire) as usize;
        if chunk < mapped {
            return Ok(self.bases[chunk].load(Ordering::Acquire));
        }

        let RegionFile { file, maps } = &mut *inner;
        if file.is_none() {
            *file = Some(self.open_file()?);
        }
        let Some(file) = file.as_ref() else {
            return Err(io::Error::other("bucket file not open"));
        };

        for index in mapped..=chunk {
            let offset = self.page_size + index * self.chunk_size;
            let needed = (offset + self.chunk_size) as u64;

            // Another process may already have extended the file
            if file.metadata()?.len() < needed {
                file.set_len(needed)?;
            }

            let mut mmap = unsafe {
                MmapOptions::new()
                    .offset(offset as u64)
                    .len(self.chunk_size)
                    .map_mut(file)?
            };

            self.bases[index].store(mmap.as_mut_ptr(), Ordering::Release);
            maps.push(mmap);
            self.mapped.store(index as u32 + 1, Ordering::Release);
            MAPPED_BYTES.add(self.chunk_size as i64);

            debug!(
                class = self.header.class,
                chunk = index,
                bytes = self.chunk_size,
                "mapped bucket chunk"
            );
        }

        Ok(self.bases[chunk].load(Ordering::Acquire))
    }

    /// Flush all mapped chunks to the backing file.
    pub(crate) fn flush(&self) -> io::Result<()> {
        let inner = self.inner.lock();
        for mmap in &inner.maps {
            mmap.flush()?;
        }
        Ok(())
    }

    fn open_file(&self) -> io::Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if file.metadata()?.len() == 0 {
            file.set_len(self.page_size as u64)?;
            file.write_all(&self.header.to_bytes())?;
            file.sync_data()?;
        } else {
            let mut bytes = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut bytes)?;
            BucketFileHeader::from_bytes(&bytes)?.validate(&self.header)?;
        }

        Ok(file)
    }
}

impl Drop for ClassRegion {
    fn drop(&mut self) {
        let mapped = self.mapped.load(Ordering::Acquire) as usize;
        MAPPED_BYTES.sub((mapped * self.chunk_size) as i64);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_round_trip() {
        let header = BucketFileHeader {
            version: FILE_VERSION,
            class: 3,
            page_size: 4096,
            bucket_size: 32768,
            chunk_size: 1 << 20,
        };
        let parsed = BucketFileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_bad_magic() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(b"NOTABKT!");
        assert!(BucketFileHeader::from_bytes(&bytes).is_err());
        assert!(BucketFileHeader::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_grow_keeps_earlier_addresses() {
        let dir = TempDir::new().unwrap();
        let region = ClassRegion::new(dir.path(), 0, 4096, 8192, 16);
        assert_eq!(region.max_chunks(), 8);
        assert!(region.base(0).is_null());

        let first = region.grow_to(0).unwrap();
        assert!(!first.is_null());
        assert_eq!(region.mapped_bytes(), 8192);

        let third = region.grow_to(2).unwrap();
        assert!(!third.is_null());
        assert_eq!(region.base(0), first);
        assert_eq!(region.mapped_bytes(), 3 * 8192);

        let len = std::fs::metadata(dir.path().join("class-00.bkt")).unwrap().len();
        assert_eq!(len, 4096 + 3 * 8192);
    }

    #[test]
    fn test_locate() {
        let dir = TempDir::new().unwrap();
        let region = ClassRegion::new(dir.path(), 1, 4096, 32768, 64);
        // 8KB buckets, 4 per chunk
        assert_eq!(region.locate(0), (0, 0));
        assert_eq!(region.locate(3), (0, 3 * 8192));
        assert_eq!(region.locate(4), (1, 0));
    }

    #[test]
    fn test_reopen_validates_header() {
        let dir = TempDir::new().unwrap();
        {
            let region = ClassRegion::new(dir.path(), 0, 4096, 8192, 16);
            region.grow_to(0).unwrap();
        }

        let same = ClassRegion::new(dir.path(), 0, 4096, 8192, 16);
        same.grow_to(1).unwrap();

        let mismatched = ClassRegion::new(dir.path(), 0, 4096, 16384, 16);
        let err = mismatched.grow_to(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
