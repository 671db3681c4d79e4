//! Durable bucket slot allocator.
//!
//! [`BucketAllocator`] tracks which slot indices of each bucket class are
//! allocated and which sit in the free list. State lives in an LMDB
//! environment so that every process mapping the same store, and every
//! restart of one, observes the same allocation state.
//!
//! # Tables
//!
//! ```text
//! allocated:  storage key (u64 BE) -> owning wpid (u64 BE)
//! free:       storage key (u64 BE) -> ()
//! high_water: class (u32 BE)       -> next never-used slot (u32 BE)
//! ```
//!
//! Storage keys sort by class then slot, so the lowest free slot of a class
//! is the first key of a range scan.

use crate::bucket::bucket_size;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::metrics::{
    BUCKETS_ALLOCATED, BUCKETS_FREED, BUCKETS_RECLAIMED, CAPACITY_ERRORS, ClassStats,
    FREE_LIST_REUSE,
};
use crate::reference::BufferReference;
use heed::byteorder::BigEndian;
use heed::types::{U32, U64, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use std::io::Write;
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// First slot handed out in every class. Slot 0 is the null reference.
pub const FIRST_SLOT: u32 = 1;

type KeyCodec = U64<BigEndian>;

/// State of a slot reported by [`BucketAllocator::enumerate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated to the given writer process.
    Allocated {
        /// Owning writer-process identity.
        wpid: u64,
    },
    /// In the free list.
    Free,
}

/// One slot in a diagnostics listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    /// The slot.
    pub reference: BufferReference,
    /// Whether it is allocated or free.
    pub state: SlotState,
}

/// Summary of the allocation index observed at open.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    /// Bucket classes with at least one slot ever handed out.
    pub classes: usize,
    /// Slots recorded as allocated.
    pub allocated: usize,
    /// Slots in the free list.
    pub free: usize,
    /// Allocated slots owned by a different wpid than this process.
    pub foreign: usize,
}

/// Slot allocator over a durable index.
pub struct BucketAllocator {
    env: Env,
    allocated: Database<KeyCodec, U64<BigEndian>>,
    free: Database<KeyCodec, Unit>,
    high_water: Database<U32<BigEndian>, U32<BigEndian>>,
    wpid: u64,
    page_size: usize,
    max_total_size: usize,
    max_bucket_class: u8,
    recovered: RecoveryStats,
}

impl BucketAllocator {
    /// Open or create the allocation index under `config.index_path()`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let path = config.index_path();
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.index_map_size)
                .max_dbs(3)
                .open(&path)?
        };

        let mut txn = env.write_txn()?;
        let allocated =
            env.create_database::<KeyCodec, U64<BigEndian>>(&mut txn, Some("allocated"))?;
        let free = env.create_database::<KeyCodec, Unit>(&mut txn, Some("free"))?;
        let high_water = env
            .create_database::<U32<BigEndian>, U32<BigEndian>>(&mut txn, Some("high_water"))?;
        txn.commit()?;

        let mut allocator = Self {
            env,
            allocated,
            free,
            high_water,
            wpid: config.wpid(),
            page_size: config.page_size,
            max_total_size: config.max_total_size,
            max_bucket_class: config.max_bucket_class,
            recovered: RecoveryStats::default(),
        };

        allocator.recovered = allocator.scan()?;
        info!(
            path = %path.display(),
            wpid = allocator.wpid,
            classes = allocator.recovered.classes,
            allocated = allocator.recovered.allocated,
            free = allocator.recovered.free,
            foreign = allocator.recovered.foreign,
            "opened allocation index"
        );

        Ok(allocator)
    }

    /// Writer-process identity recorded on allocations.
    pub fn wpid(&self) -> u64 {
        self.wpid
    }

    /// Page size (class 0 buffer size).
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest bucket class served.
    pub fn max_bucket_class(&self) -> u8 {
        self.max_bucket_class
    }

    /// Configured budget in bytes.
    pub fn max_total_size(&self) -> usize {
        self.max_total_size
    }

    /// Index state observed when the allocator was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovered
    }

    /// Allocate a slot in `class`.
    ///
    /// Reuses the lowest free slot if the class has one, reporting
    /// `from_free_list = true`. Otherwise extends the class by its next
    /// never-used slot, failing with `NotEnoughSpace` if that would push
    /// the footprint past the budget. A failed attempt changes nothing.
    pub fn allocate(&self, class: u8) -> Result<(BufferReference, bool)> {
        self.check_class(class)?;

        let mut txn = self.env.write_txn()?;

        let reused = self
            .free
            .range(&txn, &class_keys(class))?
            .next()
            .transpose()?
            .map(|(key, ())| key);

        let (reference, from_free_list) = match reused {
            Some(key) => {
                self.free.delete(&mut txn, &key)?;
                (BufferReference::from_raw(key), true)
            }
            None => {
                let slot = self
                    .high_water
                    .get(&txn, &(class as u32))?
                    .unwrap_or(FIRST_SLOT);
                let size = bucket_size(class, self.page_size);
                let footprint = self.footprint_in(&txn)?;
                let available = self.max_total_size.saturating_sub(footprint);

                if size > available || slot == u32::MAX {
                    CAPACITY_ERRORS.increment();
                    debug!(class, requested = size, available, "allocation over budget");
                    return Err(StoreError::NotEnoughSpace {
                        requested: size,
                        available,
                    });
                }

                self.high_water.put(&mut txn, &(class as u32), &(slot + 1))?;
                (BufferReference::new(class, slot), false)
            }
        };

        self.allocated
            .put(&mut txn, &reference.storage_key(), &self.wpid)?;
        txn.commit()?;

        BUCKETS_ALLOCATED.increment();
        if from_free_list {
            FREE_LIST_REUSE.increment();
        }
        debug!(
            class,
            slot = reference.slot(),
            from_free_list,
            "allocated bucket"
        );

        Ok((reference, from_free_list))
    }

    /// Return a slot to the free list.
    ///
    /// Fails with `NotFound` if the slot was never allocated or is already
    /// free. The flag bit of `reference` is ignored.
    pub fn free(&self, reference: BufferReference) -> Result<()> {
        let key = reference.storage_key();
        let mut txn = self.env.write_txn()?;

        if reference.is_none() || self.allocated.get(&txn, &key)?.is_none() {
            return Err(StoreError::NotFound(reference));
        }

        self.allocated.delete(&mut txn, &key)?;
        self.free.put(&mut txn, &key, &())?;
        txn.commit()?;

        BUCKETS_FREED.increment();
        debug!(
            class = reference.class(),
            slot = reference.slot(),
            "freed bucket"
        );

        Ok(())
    }

    /// Bytes held by allocated slots, for one class or all of them.
    pub fn total_allocated(&self, class: Option<u8>) -> Result<usize> {
        let txn = self.env.read_txn()?;
        let keys = match class {
            Some(class) => class_keys(class),
            None => 0..=u64::MAX,
        };

        let mut total = 0;
        for entry in self.allocated.range(&txn, &keys)? {
            let (key, _) = entry?;
            total += bucket_size(BufferReference::from_raw(key).class(), self.page_size);
        }
        Ok(total)
    }

    /// Bytes reserved by every slot ever handed out.
    pub fn footprint(&self) -> Result<usize> {
        let txn = self.env.read_txn()?;
        self.footprint_in(&txn)
    }

    /// Check whether the slot is in the free list.
    pub fn is_in_free_list(&self, reference: BufferReference) -> Result<bool> {
        let txn = self.env.read_txn()?;
        Ok(self.free.get(&txn, &reference.storage_key())?.is_some())
    }

    /// Check whether the slot is currently allocated.
    pub fn is_allocated(&self, reference: BufferReference) -> Result<bool> {
        Ok(self.owner(reference)?.is_some())
    }

    /// Writer process that owns an allocated slot.
    pub fn owner(&self, reference: BufferReference) -> Result<Option<u64>> {
        let txn = self.env.read_txn()?;
        Ok(self.allocated.get(&txn, &reference.storage_key())?)
    }

    /// Slots currently allocated by `wpid`.
    pub fn allocations_by(&self, wpid: u64) -> Result<Vec<BufferReference>> {
        let txn = self.env.read_txn()?;
        let mut found = Vec::new();
        for entry in self.allocated.iter(&txn)? {
            let (key, owner) = entry?;
            if owner == wpid {
                found.push(BufferReference::from_raw(key));
            }
        }
        Ok(found)
    }

    /// Free every slot still recorded for a dead writer process.
    ///
    /// Returns the number of slots moved to the free list. Reclaiming this
    /// process's own wpid is rejected since its handles may still be live.
    pub fn reclaim(&self, wpid: u64) -> Result<usize> {
        if wpid == self.wpid {
            return Err(StoreError::InvalidState(
                "cannot reclaim allocations of the current writer",
            ));
        }

        let mut txn = self.env.write_txn()?;
        let mut orphans = Vec::new();
        for entry in self.allocated.iter(&txn)? {
            let (key, owner) = entry?;
            if owner == wpid {
                orphans.push(key);
            }
        }

        for key in &orphans {
            self.allocated.delete(&mut txn, key)?;
            self.free.put(&mut txn, key, &())?;
        }
        txn.commit()?;

        if !orphans.is_empty() {
            BUCKETS_RECLAIMED.add(orphans.len() as u64);
            warn!(wpid, slots = orphans.len(), "reclaimed orphaned buckets");
        }

        Ok(orphans.len())
    }

    /// List allocated and free slots in key order.
    pub fn enumerate(&self, class: Option<u8>) -> Result<Vec<SlotEntry>> {
        let txn = self.env.read_txn()?;
        let keys = match class {
            Some(class) => class_keys(class),
            None => 0..=u64::MAX,
        };

        let mut entries = Vec::new();
        for entry in self.allocated.range(&txn, &keys)? {
            let (key, wpid) = entry?;
            entries.push(SlotEntry {
                reference: BufferReference::from_raw(key),
                state: SlotState::Allocated { wpid },
            });
        }
        for entry in self.free.range(&txn, &keys)? {
            let (key, ()) = entry?;
            entries.push(SlotEntry {
                reference: BufferReference::from_raw(key),
                state: SlotState::Free,
            });
        }

        entries.sort_by_key(|e| e.reference);
        Ok(entries)
    }

    /// Per-class usage for every class that was ever extended.
    pub fn stats(&self) -> Result<Vec<ClassStats>> {
        let txn = self.env.read_txn()?;
        let mut classes = Vec::new();

        for entry in self.high_water.iter(&txn)? {
            let (class, high_water) = entry?;
            let class = class as u8;
            let keys = class_keys(class);
            let allocated = self.allocated.range(&txn, &keys)?.count() as u64;
            let free = self.free.range(&txn, &keys)?.count() as u64;
            classes.push(ClassStats {
                class,
                bucket_size: bucket_size(class, self.page_size),
                allocated,
                free,
                high_water,
            });
        }

        Ok(classes)
    }

    /// Write a human-readable listing of slots.
    ///
    /// `formatter` renders each entry; the default prints the reference,
    /// its state and, for allocated slots, the owning wpid.
    pub fn print<W: Write>(
        &self,
        out: &mut W,
        class: Option<u8>,
        formatter: Option<&dyn Fn(&SlotEntry) -> String>,
    ) -> Result<()> {
        for stats in self.stats()? {
            if class.is_some_and(|c| c != stats.class) {
                continue;
            }
            writeln!(
                out,
                "class {:>2} ({} bytes): {} allocated, {} free, high water {}",
                stats.class, stats.bucket_size, stats.allocated, stats.free, stats.high_water
            )?;
        }

        for entry in self.enumerate(class)? {
            let line = match formatter {
                Some(format) => format(&entry),
                None => default_format(&entry),
            };
            writeln!(out, "  {line}")?;
        }

        Ok(())
    }

    fn check_class(&self, class: u8) -> Result<()> {
        if class > self.max_bucket_class {
            return Err(StoreError::BucketOutOfRange {
                class,
                max: self.max_bucket_class,
            });
        }
        Ok(())
    }

    fn footprint_in(&self, txn: &RoTxn) -> Result<usize> {
        let mut footprint = 0;
        for entry in self.high_water.iter(txn)? {
            let (class, next) = entry?;
            footprint +=
                next.saturating_sub(FIRST_SLOT) as usize * bucket_size(class as u8, self.page_size);
        }
        Ok(footprint)
    }

    fn scan(&self) -> Result<RecoveryStats> {
        let txn = self.env.read_txn()?;
        let mut stats = RecoveryStats {
            classes: self.high_water.len(&txn)? as usize,
            free: self.free.len(&txn)? as usize,
            ..Default::default()
        };

        for entry in self.allocated.iter(&txn)? {
            let (_, wpid) = entry?;
            stats.allocated += 1;
            if wpid != self.wpid {
                stats.foreign += 1;
            }
        }

        Ok(stats)
    }
}

fn class_keys(class: u8) -> RangeInclusive<u64> {
    let first = (class as u64) << 32;
    first..=first | u32::MAX as u64
}

fn default_format(entry: &SlotEntry) -> String {
    match entry.state {
        SlotState::Allocated { wpid } => format!("{} allocated wpid={}", entry.reference, wpid),
        SlotState::Free => format!("{} free", entry.reference),
    }
}
