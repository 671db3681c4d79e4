//! Integration tests for append blocks, logs and the block archive.

#![cfg(not(feature = "loom"))]

use append_log::{
    AppendBlock, AppendLog, BlockArchive, BlockState, Claim, DiscardSink, HEADER_SIZE, LogConfig,
    LogError, PendingBlocks, frame_len,
};
use std::sync::Arc;
use std::thread;
use store_core::{PooledMemoryPool, PooledMemoryPoolBuilder};
use tempfile::TempDir;

const PAGE: usize = 4096;

fn open_pool(dir: &TempDir) -> PooledMemoryPool {
    PooledMemoryPoolBuilder::new(dir.path().join("store"))
        .max_total_size(16 << 20)
        .segment_size(256 * 1024)
        .wpid(7)
        .build()
        .unwrap()
}

fn page_config(dir: &TempDir) -> LogConfig {
    LogConfig {
        throughput_hint: PAGE,
        min_block_size: PAGE,
        max_block_size: PAGE,
        archive_path: dir.path().join("archive"),
        archive_map_size: 1 << 24,
    }
}

#[test]
fn test_block_holds_k_entries_then_rotates() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir);
    let archive = Arc::new(BlockArchive::from_config(&page_config(&dir)).unwrap());
    let log = AppendLog::new(pool.clone(), archive.clone(), page_config(&dir), 11, 24, 0).unwrap();

    // 24 byte values take 32 byte frames
    let k = ((PAGE - HEADER_SIZE) / frame_len(24)) as u64;
    for version in 0..k {
        assert_eq!(log.append(&[version as u8; 24]).unwrap(), version);
    }
    assert_eq!(log.active_first_version(), 0);
    assert!(archive.is_empty().unwrap());

    assert_eq!(log.append(&[0xFF; 24]).unwrap(), k);
    assert_eq!(log.active_first_version(), k);

    let archived = archive.get(11, 0).unwrap().unwrap();
    assert_eq!(archived.count as u64, k);
    for (version, payload) in archived.frames() {
        assert_eq!(payload, &[version as u8; 24]);
    }

    log.close().unwrap();
    assert_eq!(archive.next_version(11).unwrap(), Some(k + 1));
    assert_eq!(pool.allocator().total_allocated(None).unwrap(), 0);
}

#[test]
fn test_claims_after_complete_fail() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir);
    let buffer = pool.rent(PAGE).unwrap();
    let block = AppendBlock::initialize(&buffer, 1, -1, 0).unwrap();
    assert_eq!(block.state(), BlockState::Writable);

    let Claim::Claimed(token) = block.claim(0, 5).unwrap() else {
        panic!("expected claim");
    };
    token.write(0, b"early").unwrap();

    block.complete();
    assert_eq!(block.state(), BlockState::Completed);
    assert!(matches!(block.claim(1, 5), Err(LogError::BlockNotWritable)));

    // a claim made before completion still commits
    assert_eq!(token.commit().unwrap(), 0);
    assert_eq!(block.len(), 1);
    block.dispose_free().unwrap();
}

#[test]
fn test_out_of_order_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir);
    let buffer = pool.rent(PAGE).unwrap();
    let block = AppendBlock::initialize(&buffer, 1, -1, 50).unwrap();

    assert!(matches!(
        block.claim(49, 1).unwrap(),
        Claim::OutOfOrder { expected: 50 }
    ));
    assert!(matches!(
        block.claim(51, 1).unwrap(),
        Claim::OutOfOrder { expected: 50 }
    ));
    assert!(block.is_empty());

    let Claim::Claimed(token) = block.claim(50, 1).unwrap() else {
        panic!("expected claim");
    };
    token.write(0, b"x").unwrap();
    token.commit().unwrap();
    block.dispose_free().unwrap();
}

#[test]
fn test_reader_in_second_handle_sees_commits() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir);
    let buffer = pool.rent(PAGE).unwrap();
    let block = AppendBlock::initialize(&buffer, 4, -1, 0).unwrap();

    let Claim::Claimed(token) = block.claim(0, 6).unwrap() else {
        panic!("expected claim");
    };
    token.write(0, b"shared").unwrap();
    token.commit().unwrap();

    // a lookup by reference resolves to the same live block
    let found = pool.lookup(block.reference()).unwrap();
    let reopened = AppendBlock::open(&found).unwrap();
    assert_eq!(reopened.stream_id(), 4);
    assert_eq!(reopened.next_version(), 1);
    let entries: Vec<_> = reopened.frames().unwrap().collect();
    assert_eq!(entries, vec![(0, &b"shared"[..])]);

    drop(reopened);
    block.dispose_free().unwrap();
}

#[test]
fn test_pending_then_archive_then_resume() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir);
    let config = page_config(&dir);
    let archive = BlockArchive::from_config(&config).unwrap();
    let pending = Arc::new(PendingBlocks::new());

    let log = AppendLog::new(pool.clone(), pending.clone(), config.clone(), 2, -1, 0).unwrap();
    thread::scope(|s| {
        for t in 0..2u8 {
            let log = &log;
            s.spawn(move || {
                for i in 0..300u32 {
                    log.append(&[t; 16]).unwrap();
                    if i % 100 == 0 {
                        log.set_throughput_hint(2 * PAGE);
                    }
                }
            });
        }
    });
    let next = log.next_version();
    assert_eq!(next, 600);
    log.close().unwrap();

    let drained = pending.drain_into(&archive).unwrap();
    assert!(drained > 1);
    assert!(pending.is_empty());

    let mut expected = 0;
    for block in archive.range(2, 0..=u64::MAX).unwrap() {
        assert_eq!(block.first_version, expected);
        expected = block.next_version();
    }
    assert_eq!(expected, next);

    let resumed =
        AppendLog::resume(pool.clone(), DiscardSink::new(), config, 2, -1, &archive).unwrap();
    assert_eq!(resumed.append(b"again").unwrap(), next);
    resumed.close().unwrap();

    assert_eq!(pool.allocator().total_allocated(None).unwrap(), 0);
}
