//! Completed blocks whose buffers wait for readers to detach.

use crate::block::AppendBlock;
use crate::error::{LogError, Result};
use crate::metrics::BLOCKS_DEFERRED;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Holding area for completed blocks that could not be freed yet.
///
/// A reader's cursor keeps its block's buffer retained, and the buffer can
/// only be returned once the cursor is released. Sinks park such blocks
/// here and [`reap`](Self::reap) returns them later.
#[derive(Default)]
pub struct RetiredBlocks {
    blocks: Mutex<Vec<AppendBlock>>,
}

impl RetiredBlocks {
    /// Create an empty holding area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks waiting.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Check whether no blocks are waiting.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Return the buffer of `block`, or keep the block if it cannot be
    /// returned yet.
    ///
    /// A block still retained by a reader is kept without error. Any other
    /// failure keeps the block for a later [`reap`](Self::reap) and is
    /// reported.
    pub fn dispose_or_retire(&self, block: AppendBlock) -> Result<()> {
        let err = match block.dispose_free() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let shared = err.is_shared();
        let (block, error) = err.into_parts();
        let (stream_id, first_version) = (block.stream_id(), block.first_version());
        self.blocks.lock().push(block);

        if shared {
            BLOCKS_DEFERRED.increment();
            debug!(
                stream_id,
                first_version,
                "deferring buffer return until readers detach"
            );
            return Ok(());
        }

        warn!(stream_id, first_version, error = %error, "failed to free block");
        Err(error)
    }

    /// Return the buffers of waiting blocks that no reader retains.
    ///
    /// Returns the number of blocks freed. Every waiting block is
    /// attempted; the first failure is reported after the sweep.
    pub fn reap(&self) -> Result<usize> {
        let mut blocks = self.blocks.lock();
        let pending = std::mem::take(&mut *blocks);

        let mut freed = 0;
        let mut first_err: Option<LogError> = None;
        for block in pending {
            if block.is_shared() {
                blocks.push(block);
                continue;
            }

            match block.dispose_free() {
                Ok(()) => freed += 1,
                Err(err) => {
                    let shared = err.is_shared();
                    let (block, error) = err.into_parts();
                    if !shared {
                        warn!(
                            reference = %block.reference(),
                            error = %error,
                            "failed to free retired block"
                        );
                        first_err.get_or_insert(error);
                    }
                    blocks.push(block);
                }
            }
        }
        drop(blocks);

        match first_err {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }
}

impl Drop for RetiredBlocks {
    fn drop(&mut self) {
        if let Err(e) = self.reap() {
            warn!(error = %e, "failed to free retired blocks");
        }

        let left = self.blocks.get_mut().len();
        if left > 0 {
            warn!(blocks = left, "dropping retired blocks still retained by readers");
        }
    }
}

impl std::fmt::Debug for RetiredBlocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetiredBlocks")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::block::Claim;
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

    fn one_entry_block(pool: &PooledMemoryPool) -> AppendBlock {
        let buffer = pool.rent(4096).unwrap();
        let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();
        let Claim::Claimed(token) = block.claim(0, 1).unwrap() else {
            panic!("expected claim");
        };
        token.write(0, b"x").unwrap();
        token.commit().unwrap();
        block
    }

    #[test]
    fn test_unshared_block_freed_now() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let retired = RetiredBlocks::new();

        retired.dispose_or_retire(one_entry_block(&pool)).unwrap();
        assert!(retired.is_empty());
        assert_eq!(pool.allocator().total_allocated(None).unwrap(), 0);
    }

    #[test]
    fn test_shared_block_waits_for_reader() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(&dir);
        let retired = RetiredBlocks::new();

        let block = one_entry_block(&pool);
        let reference = block.reference();
        let cursor = block.cursor().unwrap();

        retired.dispose_or_retire(block).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired.reap().unwrap(), 0);
        assert!(pool.allocator().is_allocated(reference).unwrap());

        cursor.release();
        assert_eq!(retired.reap().unwrap(), 1);
        assert!(retired.is_empty());
        assert!(pool.allocator().is_in_free_list(reference).unwrap());
    }
}
