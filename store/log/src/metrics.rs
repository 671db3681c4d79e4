//! Append log metrics.

use metriken::{Counter, metric};

#[metric(name = "log_claims", description = "Entries claimed in append blocks")]
pub static BLOCK_CLAIMS: Counter = Counter::new();

#[metric(
    name = "log_blocks_full",
    description = "Claims rejected because the block was full"
)]
pub static BLOCKS_FULL: Counter = Counter::new();

#[metric(name = "log_rotations", description = "Active block rotations")]
pub static ROTATIONS: Counter = Counter::new();

#[metric(
    name = "log_blocks_archived",
    description = "Completed blocks written to the archive"
)]
pub static BLOCKS_ARCHIVED: Counter = Counter::new();

#[metric(
    name = "log_blocks_deferred",
    description = "Archived blocks whose buffer return waits for readers"
)]
pub static BLOCKS_DEFERRED: Counter = Counter::new();

#[metric(
    name = "log_claims_abandoned",
    description = "Claims dropped without a commit"
)]
pub static CLAIMS_ABANDONED: Counter = Counter::new();

#[metric(
    name = "log_sink_failures",
    description = "Completed blocks the sink failed to accept"
)]
pub static SINK_FAILURES: Counter = Counter::new();
