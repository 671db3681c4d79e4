//! Queue of completed blocks awaiting a slower sink.
//!
//! Rotation hands blocks to the sink while holding no lock, but a sink
//! that writes to disk still delays the appender that rotated. Pushing to
//! a [`PendingBlocks`] queue instead lets a background thread drain it
//! into the archive.

use crate::block::AppendBlock;
use crate::error::Result;
use crate::log::BlockSink;
use crossbeam_deque::{Injector, Steal};
use tracing::trace;

/// Lock-free FIFO of completed blocks.
#[derive(Default)]
pub struct PendingBlocks {
    queue: Injector<AppendBlock>,
}

impl PendingBlocks {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether no blocks are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Move every queued block into `sink`, oldest first.
    ///
    /// Stops at the first sink error. Blocks after the failed one stay
    /// queued.
    pub fn drain_into<S: BlockSink + ?Sized>(&self, sink: &S) -> Result<usize> {
        let mut drained = 0;
        loop {
            match self.queue.steal() {
                Steal::Success(block) => {
                    sink.accept(block)?;
                    drained += 1;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }

        if drained > 0 {
            trace!(drained, "drained pending blocks");
        }
        Ok(drained)
    }
}

impl BlockSink for PendingBlocks {
    fn accept(&self, block: AppendBlock) -> Result<()> {
        self.queue.push(block);
        Ok(())
    }
}

impl std::fmt::Debug for PendingBlocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBlocks")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::block::Claim;
    use crate::log::DiscardSink;
    use parking_lot::Mutex;
    use store_core::{PooledMemoryPool, PooledMemoryPoolBuilder};
    use tempfile::TempDir;

    fn create_pool(dir: &TempDir) -> PooledMemoryPool {
        PooledMemoryPoolBuilder::new(dir.path())
            .max_total_size(1 << 20)
            .segment_size(64 * 1024)
            .wpid(1)
            .build()
            .unwrap()
    }

    fn completed_block(pool: &PooledMemoryPool, first_version: u64) -> AppendBlock {
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, first_version).unwrap();
        let Claim::Claimed(token) = block.claim(first_version, 4).unwrap() else {
            panic!("expected claim");
        };
        token.write(0, b"data").unwrap();
        token.commit().unwrap();
        block.complete();
        block
    }

    struct OrderSink {
        seen: Mutex<Vec<u64>>,
    }

    impl BlockSink for OrderSink {
        fn accept(&self, block: AppendBlock) -> Result<()> {
            self.seen.lock().push(block.first_version());
            block.dispose_free().map_err(|e| e.into_parts().1)
        }
    }

    #[test]
    fn test_drain_in_order() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let pending = PendingBlocks::new();

        for first in [0, 1, 2] {
            pending.accept(completed_block(&pool, first)).unwrap();
        }
        assert_eq!(pending.len(), 3);

        let sink = OrderSink {
            seen: Mutex::new(Vec::new()),
        };
        assert_eq!(pending.drain_into(&sink).unwrap(), 3);
        assert_eq!(*sink.seen.lock(), vec![0, 1, 2]);
        assert!(pending.is_empty());
        assert_eq!(pool.allocator().total_allocated(None).unwrap(), 0);
    }

    #[test]
    fn test_drain_empty() {
        let pending = PendingBlocks::new();
        assert_eq!(pending.drain_into(&DiscardSink::new()).unwrap(), 0);
    }
}
