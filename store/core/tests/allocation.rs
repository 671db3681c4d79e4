//! Integration tests for allocation and pooled buffer lifecycles.
//!
//! Every test opens a fresh store under a temporary directory.

#![cfg(not(feature = "loom"))]

use std::thread;
use store_core::{
    BufferReference, PooledMemoryPool, PooledMemoryPoolBuilder, StoreConfig, StoreError,
};
use tempfile::TempDir;

const PAGE: usize = 4096;

fn open_pool(dir: &TempDir, wpid: u64) -> PooledMemoryPool {
    PooledMemoryPoolBuilder::new(dir.path())
        .max_total_size(8 << 20)
        .segment_size(256 * 1024)
        .pow2_threshold(16 * PAGE)
        .max_bucket_class(10)
        .wpid(wpid)
        .build()
        .unwrap()
}

#[test]
fn test_allocate_free_reuse_scenario() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 100);
    let allocator = pool.allocator();

    let (br0, _) = allocator.allocate(0).unwrap();
    let (br1, _) = allocator.allocate(1).unwrap();
    let (br2, _) = allocator.allocate(2).unwrap();
    assert_eq!((br1.class(), br2.class()), (1, 2));

    let (br0_1, reused) = allocator.allocate(0).unwrap();
    assert!(!reused);
    let (br0_2, _) = allocator.allocate(0).unwrap();
    assert_eq!(br0_1.slot(), 2);
    assert_eq!(br0_2.slot(), 3);

    allocator.free(br0_1).unwrap();
    assert!(allocator.is_in_free_list(br0_1).unwrap());

    let (again, from_free_list) = allocator.allocate(0).unwrap();
    assert!(from_free_list);
    assert_eq!(again, br0_1);

    for reference in [br0, br1, br2, again, br0_2] {
        allocator.free(reference).unwrap();
    }
    for class in 0..=2 {
        assert_eq!(allocator.total_allocated(Some(class)).unwrap(), 0);
    }
}

#[test]
fn test_allocate_free_pairs_return_to_zero() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);
    let allocator = pool.allocator();

    for class in 0..=4u8 {
        for _ in 0..5 {
            let (reference, _) = allocator.allocate(class).unwrap();
            allocator.free(reference).unwrap();
        }
        assert_eq!(allocator.total_allocated(Some(class)).unwrap(), 0);
    }
    assert_eq!(allocator.total_allocated(None).unwrap(), 0);
}

#[test]
fn test_free_unknown_reference() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);
    let allocator = pool.allocator();

    let never = BufferReference::new(0, 7);
    assert!(matches!(allocator.free(never), Err(StoreError::NotFound(_))));

    let (reference, _) = allocator.allocate(0).unwrap();
    allocator.free(reference).unwrap();
    assert!(matches!(
        allocator.free(reference),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_capacity_error_leaves_state_unchanged() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);
    let allocator = pool.allocator();

    // class 10 buckets are 4MB, two of them fill the 8MB budget
    let (a, _) = allocator.allocate(10).unwrap();
    let (b, _) = allocator.allocate(10).unwrap();
    let before = allocator.total_allocated(None).unwrap();

    let err = allocator.allocate(0).unwrap_err();
    assert!(err.is_capacity());
    assert!(matches!(err, StoreError::NotEnoughSpace { .. }));
    assert_eq!(allocator.total_allocated(None).unwrap(), before);

    allocator.free(a).unwrap();
    allocator.free(b).unwrap();
}

#[test]
fn test_rent_length_properties() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);
    let threshold = pool.pow2_threshold();

    for requested in [1, 100, PAGE, PAGE + 1, 7 * PAGE - 3, threshold, threshold + 1, 300_000] {
        let buffer = pool.rent(requested).unwrap();
        assert!(buffer.length() >= requested);
        assert!(buffer.length_pow2() >= buffer.length());
        if requested > threshold {
            assert!(buffer.length().is_power_of_two());
            assert_eq!(buffer.length(), buffer.length_pow2());
        } else {
            assert_eq!(buffer.length() % PAGE, 0);
        }
        pool.return_buffer(&buffer, false).unwrap();
    }
}

#[test]
fn test_reference_counting_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);
    let buffer = pool.rent(2 * PAGE).unwrap();

    for n in [1usize, 4, 16] {
        let buffer = pool.rent(PAGE).unwrap();
        let views: Vec<_> = (0..n).map(|_| buffer.retain().unwrap()).collect();
        assert!(buffer.dispose().is_err());
        assert!(pool.return_buffer(&buffer, false).is_err());

        for (i, view) in views.into_iter().enumerate() {
            assert!(!buffer.is_disposed(), "disposed after {i} releases");
            view.release();
        }
        assert!(buffer.is_disposed());
        assert!(matches!(buffer.dispose(), Err(StoreError::AlreadyDisposed)));
        pool.return_buffer(&buffer, false).unwrap();
    }

    pool.return_buffer(&buffer, false).unwrap();
}

#[test]
fn test_concurrent_rent_return() {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir, 1);

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let buffer = pool.rent(PAGE * (1 + (i + t) % 3)).unwrap();
                    let view = buffer.retain().unwrap();
                    view.view().write(0, &[t as u8; 8]).unwrap();
                    let mut out = [0u8; 8];
                    view.view().read(0, &mut out).unwrap();
                    assert_eq!(out, [t as u8; 8]);
                    view.release();
                    pool.return_buffer(&buffer, false).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pool.allocator().total_allocated(None).unwrap(), 0);
    assert_eq!(pool.live_handles(), 0);
}

#[test]
fn test_reclaim_orphans_after_reopen() {
    let dir = TempDir::new().unwrap();

    let orphaned = {
        let pool = open_pool(&dir, 41);
        let kept = pool.rent(PAGE).unwrap();
        kept.view().unwrap().write(0, b"orphan").unwrap();
        let reference = kept.reference();
        // writer exits without returning its buffers
        drop(kept);
        reference
    };

    let pool = open_pool(&dir, 42);
    let recovered = pool.allocator().recovery_stats();
    assert_eq!(recovered.allocated, 1);

    let found = pool.lookup(orphaned).unwrap();
    let mut out = [0u8; 6];
    found.view().unwrap().read(0, &mut out).unwrap();
    assert_eq!(&out, b"orphan");
    drop(found);

    assert_eq!(pool.allocator().owner(orphaned).unwrap(), Some(41));
    assert_eq!(pool.allocator().reclaim(41).unwrap(), 1);
    assert!(pool.allocator().is_in_free_list(orphaned).unwrap());

    let (reused, from_free_list) = pool.allocator().allocate(0).unwrap();
    assert!(from_free_list);
    assert_eq!(reused, orphaned);
}

#[test]
fn test_open_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path());
    config.max_total_size = 1 << 20;
    config.wpid = Some(9);

    let pool = PooledMemoryPool::open(&config).unwrap();
    assert_eq!(pool.allocator().wpid(), 9);
    assert_eq!(pool.store().available_free_space(), 1 << 20);

    let buffer = pool.rent(PAGE).unwrap();
    assert!(pool.store().available_free_space() < 1 << 20);
    pool.return_buffer(&buffer, false).unwrap();

    let mut listing = Vec::new();
    pool.print(&mut listing, None, None).unwrap();
    let listing = String::from_utf8(listing).unwrap();
    assert!(listing.contains("class  0"));
    assert!(listing.contains("0:1 free"));
}
