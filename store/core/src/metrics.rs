//! Store metrics and statistics.
//!
//! Process-wide counters are registered with `metriken`. [`PoolStats`] is a
//! point-in-time snapshot built from the allocator for diagnostics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "store_buckets_allocated",
    description = "Bucket slots handed out by the allocator"
)]
pub static BUCKETS_ALLOCATED: Counter = Counter::new();

#[metric(
    name = "store_buckets_freed",
    description = "Bucket slots returned to the free list"
)]
pub static BUCKETS_FREED: Counter = Counter::new();

#[metric(
    name = "store_free_list_reuse",
    description = "Allocations satisfied from the free list"
)]
pub static FREE_LIST_REUSE: Counter = Counter::new();

#[metric(
    name = "store_capacity_errors",
    description = "Allocations rejected by the total size budget"
)]
pub static CAPACITY_ERRORS: Counter = Counter::new();

#[metric(
    name = "store_buckets_reclaimed",
    description = "Orphaned slots reclaimed from dead writers"
)]
pub static BUCKETS_RECLAIMED: Counter = Counter::new();

#[metric(
    name = "store_mapped_bytes",
    description = "Bytes currently memory-mapped across bucket classes"
)]
pub static MAPPED_BYTES: Gauge = Gauge::new();

#[metric(name = "pool_rents", description = "Buffers rented from the pool")]
pub static POOL_RENTS: Counter = Counter::new();

#[metric(name = "pool_returns", description = "Buffers returned to the pool")]
pub static POOL_RETURNS: Counter = Counter::new();

#[metric(
    name = "pool_handles_live",
    description = "Live in-process buffer handles"
)]
pub static HANDLES_LIVE: Gauge = Gauge::new();

#[metric(
    name = "pool_handles_leaked",
    description = "Owned handles dropped without being returned"
)]
pub static HANDLES_LEAKED: Counter = Counter::new();

/// Snapshot of allocator usage for one bucket class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Bucket class.
    pub class: u8,
    /// Buffer size of this class.
    pub bucket_size: usize,
    /// Slots currently allocated.
    pub allocated: u64,
    /// Slots waiting in the free list.
    pub free: u64,
    /// Next never-used slot index.
    pub high_water: u32,
}

impl ClassStats {
    /// Bytes held by allocated slots.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated as usize * self.bucket_size
    }

    /// Bytes reserved by every slot ever handed out.
    pub fn footprint(&self) -> usize {
        self.high_water.saturating_sub(1) as usize * self.bucket_size
    }
}

/// Snapshot of pool usage across all classes.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Per-class statistics for classes that were ever used.
    pub classes: Vec<ClassStats>,
    /// Configured maximum total size.
    pub max_total_size: usize,
    /// Bytes currently mapped by the store.
    pub mapped_bytes: usize,
    /// Live handles in this process.
    pub live_handles: usize,
}

impl PoolStats {
    /// Bytes held by allocated slots.
    pub fn allocated_bytes(&self) -> usize {
        self.classes.iter().map(ClassStats::allocated_bytes).sum()
    }

    /// Bytes reserved across all classes.
    pub fn footprint(&self) -> usize {
        self.classes.iter().map(ClassStats::footprint).sum()
    }

    /// Get utilization as a percentage (0.0 - 100.0).
    pub fn utilization(&self) -> f64 {
        if self.max_total_size == 0 {
            0.0
        } else {
            (self.allocated_bytes() as f64 / self.max_total_size as f64) * 100.0
        }
    }
}
