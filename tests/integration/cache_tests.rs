//! Decorator pipelines: alignment, caching, coalescing, eviction bounds.

use std::sync::Arc;
use std::time::Duration;

use range_reader::{BlockAligned, DiskCache, MemoryCache, RangeReader};

use super::test_utils::{test_content, TrackingReader};

const BLOCK: usize = 64 * 1024;

// =============================================================================
// Block alignment
// =============================================================================

#[tokio::test]
async fn test_aligner_widens_to_single_block_fetch() {
    let data = test_content(4 * BLOCK);
    let backend = TrackingReader::new(data.clone());
    let aligned = BlockAligned::with_block_size(Arc::clone(&backend), BLOCK);

    let bytes = aligned.read_at(100, 500).await.unwrap();
    assert_eq!(&bytes[..], &data[100..600]);

    // Exactly one backend call, for the whole first block.
    assert_eq!(backend.requests(), vec![(0, BLOCK)]);
}

#[tokio::test]
async fn test_cache_over_aligner_elides_repeat_fetches() {
    let data = test_content(4 * BLOCK);
    let backend = TrackingReader::new(data.clone());
    let pipeline = MemoryCache::block_aligned_with(
        BlockAligned::with_block_size(Arc::clone(&backend), BLOCK),
        BLOCK,
        u64::MAX,
        64,
    );

    let bytes = pipeline.read_at(100, 500).await.unwrap();
    assert_eq!(&bytes[..], &data[100..600]);
    assert_eq!(backend.calls(), 1);

    // Same block, different range: served from cache, zero new calls.
    let bytes = pipeline.read_at(200, 100).await.unwrap();
    assert_eq!(&bytes[..], &data[200..300]);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_pipeline_delivers_backend_bytes_for_every_shape() {
    let len = 3 * BLOCK + 777;
    let data = test_content(len);
    let backend = TrackingReader::new(data.clone());
    let pipeline = MemoryCache::block_aligned_with(
        BlockAligned::with_block_size(Arc::clone(&backend), BLOCK),
        BLOCK,
        u64::MAX,
        64,
    );

    // Within a block, across boundaries, block-exact, tail, past-eof.
    let cases: &[(u64, usize)] = &[
        (0, 1),
        (1, BLOCK),
        (100, 500),
        (BLOCK as u64 - 1, 2),
        (0, 2 * BLOCK),
        (BLOCK as u64, BLOCK),
        (len as u64 - 10, 100),
        (len as u64, 10),
        (0, len),
    ];
    for &(offset, want) in cases {
        let bytes = pipeline.read_at(offset, want).await.unwrap();
        let start = (offset as usize).min(len);
        let end = (start + want).min(len);
        assert_eq!(&bytes[..], &data[start..end], "range ({}, {})", offset, want);
    }
}

#[tokio::test]
async fn test_range_keyed_cache_under_aligner_overlaps() {
    // The discouraged order: aligner outside a range-keyed cache. Reads
    // that cross block boundaries widen to different spans, so the cache
    // accumulates overlapping entries covering the same bytes twice.
    let data = test_content(4 * BLOCK);
    let backend = TrackingReader::new(data.clone());
    let wrong_order = BlockAligned::with_block_size(
        MemoryCache::with_capacity(Arc::clone(&backend), u64::MAX, 64),
        BLOCK,
    );

    wrong_order.read_at(100, 500).await.unwrap(); // spans [0, BLOCK)
    wrong_order.read_at(BLOCK as u64 - 100, 200).await.unwrap(); // spans [0, 2*BLOCK)

    let cache = wrong_order.inner();
    assert_eq!(cache.entry_count().await, 2);
    // Two entries but only 2*BLOCK distinct bytes: the first block is
    // stored twice.
    assert_eq!(cache.cached_bytes().await, (BLOCK + 2 * BLOCK) as u64);

    // The recommended order keys by block, so the same reads share blocks.
    let backend2 = TrackingReader::new(data.clone());
    let right_order = MemoryCache::block_aligned_with(
        BlockAligned::with_block_size(Arc::clone(&backend2), BLOCK),
        BLOCK,
        u64::MAX,
        64,
    );
    right_order.read_at(100, 500).await.unwrap();
    right_order.read_at(BLOCK as u64 - 100, 200).await.unwrap();
    assert_eq!(right_order.cached_bytes().await, (2 * BLOCK) as u64);
}

// =============================================================================
// Single-flight under contention
// =============================================================================

#[tokio::test]
async fn test_thirty_two_tasks_one_backend_call() {
    let data = test_content(BLOCK);
    let backend = TrackingReader::with_delay(data.clone(), Duration::from_millis(100));
    let pipeline = Arc::new(MemoryCache::block_aligned_with(
        BlockAligned::with_block_size(Arc::clone(&backend), BLOCK),
        BLOCK,
        u64::MAX,
        64,
    ));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.read_at(0, BLOCK).await.unwrap()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(backend.calls(), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(&results[0][..], &data[..]);
}

// =============================================================================
// Hit rate and bounds
// =============================================================================

#[tokio::test]
async fn test_hit_rate_approaches_one_when_working_set_fits() {
    let data = test_content(8 * BLOCK);
    let backend = TrackingReader::new(data.clone());
    let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), BLOCK, u64::MAX, 64);

    // Five passes over the same working set: only the first one misses.
    for _ in 0..5 {
        for block in 0..8u64 {
            cache.read_at(block * BLOCK as u64 + 17, 1000).await.unwrap();
        }
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, 8);
    assert_eq!(stats.hits, 32);
    assert!(stats.hit_rate() >= 0.75);
    assert_eq!(backend.calls(), 8);
}

#[tokio::test]
async fn test_disk_cache_stays_within_byte_bound() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_content(10 * BLOCK);
    let backend = TrackingReader::new(data.clone());
    // Room for four blocks on disk.
    let cache = DiskCache::open_with(
        Arc::clone(&backend),
        dir.path(),
        4 * BLOCK as u64,
        BLOCK,
    )
    .await
    .unwrap();

    for block in 0..10u64 {
        let bytes = cache.read_at(block * BLOCK as u64, 1000).await.unwrap();
        let start = (block as usize) * BLOCK;
        assert_eq!(&bytes[..], &data[start..start + 1000]);
    }

    assert!(cache.disk_bytes().await <= 4 * BLOCK as u64);
    assert!(cache.entry_count().await <= 4);
    assert!(cache.stats().evictions >= 6);
}

#[tokio::test]
async fn test_layered_disk_and_memory_caches() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_content(4 * BLOCK);

    let backend = TrackingReader::new(data.clone());
    let disk = DiskCache::open_with(Arc::clone(&backend), dir.path(), u64::MAX, BLOCK)
        .await
        .unwrap();
    let pipeline = MemoryCache::block_aligned_with(disk, BLOCK, u64::MAX, 64);

    let bytes = pipeline.read_at(100, BLOCK).await.unwrap();
    assert_eq!(&bytes[..], &data[100..100 + BLOCK]);
    assert_eq!(backend.calls(), 2);

    // Hot path: memory cache absorbs repeats, disk untouched.
    pipeline.read_at(100, BLOCK).await.unwrap();
    assert_eq!(backend.calls(), 2);
}
