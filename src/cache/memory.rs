//! Bounded in-memory caching layer over any [`RangeReader`].

use std::num::NonZeroUsize;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::trace;

use super::{CacheStats, CacheStatsSnapshot, SingleFlight};
use crate::error::ReadError;
use crate::reader::RangeReader;

/// Default block size for block-keyed memory caching: 64 KiB.
pub const DEFAULT_MEMORY_BLOCK_SIZE: usize = 64 * 1024;

/// Default total-byte bound: 64 MiB.
pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default entry bound, keeping LRU bookkeeping small.
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 10_000;

/// Cache key: either the request range verbatim, or a block index when the
/// cache chunks requests itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Range { offset: u64, len: usize },
    Block(u64),
}

struct Shelf {
    map: LruCache<CacheKey, Bytes>,
    bytes: u64,
}

/// In-memory LRU cache decorator.
///
/// Two keying modes:
///
/// - **Range mode** ([`MemoryCache::new`]): entries are keyed by the exact
///   `(offset, len)` requested. Appropriate when an aligner upstream already
///   shapes requests, or when the workload repeats identical ranges.
/// - **Block mode** ([`MemoryCache::block_aligned`]): requests are chunked
///   into fixed-size blocks keyed by block index; each missing block is
///   fetched with one aligned inner read and reads spanning several blocks
///   are reassembled. This is what makes many small scattered reads cheap:
///   they collapse onto a handful of cached blocks.
///
/// Eviction is LRU with both an entry-count and a total-byte bound.
/// Concurrent misses for the same key are collapsed to a single inner fetch;
/// all waiters share the result, or the error.
#[derive(Debug)]
pub struct MemoryCache<R> {
    inner: R,
    block_size: Option<usize>,
    max_bytes: u64,
    shelf: RwLock<Shelf>,
    flights: SingleFlight<CacheKey>,
    stats: CacheStats,
}

impl<R: RangeReader> MemoryCache<R> {
    /// Range-keyed cache with default bounds.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_MEMORY_MAX_BYTES, DEFAULT_MEMORY_MAX_ENTRIES)
    }

    /// Range-keyed cache with explicit byte and entry bounds.
    ///
    /// # Panics
    /// Panics if `max_entries` is zero.
    pub fn with_capacity(inner: R, max_bytes: u64, max_entries: usize) -> Self {
        Self {
            inner,
            block_size: None,
            max_bytes,
            shelf: RwLock::new(Shelf {
                map: LruCache::new(NonZeroUsize::new(max_entries).unwrap()),
                bytes: 0,
            }),
            flights: SingleFlight::new(),
            stats: CacheStats::default(),
        }
    }

    /// Block-keyed cache with the default 64 KiB block size and bounds.
    pub fn block_aligned(inner: R) -> Self {
        Self::block_aligned_with(
            inner,
            DEFAULT_MEMORY_BLOCK_SIZE,
            DEFAULT_MEMORY_MAX_BYTES,
            DEFAULT_MEMORY_MAX_ENTRIES,
        )
    }

    /// Block-keyed cache with explicit block size and bounds.
    ///
    /// # Panics
    /// Panics if `block_size` or `max_entries` is zero.
    pub fn block_aligned_with(
        inner: R,
        block_size: usize,
        max_bytes: u64,
        max_entries: usize,
    ) -> Self {
        assert!(block_size > 0, "block_size must be non-zero");
        let mut cache = Self::with_capacity(inner, max_bytes, max_entries);
        cache.block_size = Some(block_size);
        cache
    }

    /// The wrapped reader.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of cached entries.
    pub async fn entry_count(&self) -> usize {
        self.shelf.read().await.map.len()
    }

    /// Total bytes held by cached entries.
    pub async fn cached_bytes(&self) -> u64 {
        self.shelf.read().await.bytes
    }

    /// Look up `key`, or fetch `[fetch_offset, fetch_offset + fetch_len)`
    /// from the inner reader under single-flight and install the result.
    async fn lookup_or_fetch(
        &self,
        key: CacheKey,
        fetch_offset: u64,
        fetch_len: usize,
    ) -> Result<Bytes, ReadError> {
        if let Some(hit) = self.shelf.write().await.map.get(&key).cloned() {
            self.stats.record_hit();
            return Ok(hit);
        }

        let flight_key = key.clone();
        self.flights
            .run(flight_key, || async move {
                // A fetch for this key may have completed between the miss
                // and this task becoming the leader.
                if let Some(hit) = self.shelf.write().await.map.get(&key).cloned() {
                    self.stats.record_hit();
                    return Ok(hit);
                }

                let started = Instant::now();
                let bytes = self.inner.read_at(fetch_offset, fetch_len).await?;
                self.stats.record_miss(started.elapsed());
                trace!(
                    source = self.inner.source_id(),
                    offset = fetch_offset,
                    len = bytes.len(),
                    "memory cache miss loaded"
                );

                if !bytes.is_empty() {
                    self.install(key, bytes.clone()).await;
                }
                Ok(bytes)
            })
            .await
    }

    async fn install(&self, key: CacheKey, bytes: Bytes) {
        let mut shelf = self.shelf.write().await;
        shelf.bytes += bytes.len() as u64;
        if let Some((old_key, old_val)) = shelf.map.push(key.clone(), bytes) {
            // Either the same key was replaced or the LRU entry fell out.
            shelf.bytes -= old_val.len() as u64;
            if old_key != key {
                self.stats.record_evictions(1);
            }
        }
        let mut evicted = 0;
        while shelf.bytes > self.max_bytes {
            match shelf.map.pop_lru() {
                Some((_, val)) => {
                    shelf.bytes -= val.len() as u64;
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.stats.record_evictions(evicted);
        }
    }

    /// Fetch one block, clipped to the object size when known.
    async fn block(&self, idx: u64, block_size: usize) -> Result<Bytes, ReadError> {
        let offset = idx * block_size as u64;
        let len = match self.inner.size() {
            Some(size) => {
                let remaining = size.saturating_sub(offset);
                (block_size as u64).min(remaining) as usize
            }
            None => block_size,
        };
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.lookup_or_fetch(CacheKey::Block(idx), offset, len).await
    }

    async fn read_blockwise(
        &self,
        offset: u64,
        len: usize,
        block_size: usize,
    ) -> Result<Bytes, ReadError> {
        let bs = block_size as u64;
        let start_block = offset / bs;
        let end_block = (offset + len as u64 - 1) / bs;

        if start_block == end_block {
            let block = self.block(start_block, block_size).await?;
            let within = (offset % bs) as usize;
            if block.len() <= within {
                return Ok(Bytes::new());
            }
            let end = (within + len).min(block.len());
            return Ok(block.slice(within..end));
        }

        let mut out = BytesMut::with_capacity(len);
        let mut current = offset;
        let mut remaining = len;
        for idx in start_block..=end_block {
            let block = self.block(idx, block_size).await?;
            let within = (current % bs) as usize;
            if block.len() <= within {
                break;
            }
            let take = (block.len() - within).min(remaining);
            out.extend_from_slice(&block[within..within + take]);
            current += take as u64;
            remaining -= take;
            if remaining == 0 || block.len() < block_size {
                break;
            }
        }
        Ok(out.freeze())
    }
}

#[async_trait]
impl<R: RangeReader> RangeReader for MemoryCache<R> {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        match self.block_size {
            Some(bs) => self.read_blockwise(offset, len, bs).await,
            None => {
                self.lookup_or_fetch(CacheKey::Range { offset, len }, offset, len)
                    .await
            }
        }
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        self.inner.source_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{content, CountingReader, FailingReader};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_block_mode_single_block_hit() {
        let data = content(1024);
        let backend = CountingReader::new(data.clone());
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, u64::MAX, 16);

        let bytes = cache.read_at(50, 100).await.unwrap();
        assert_eq!(&bytes[..], &data[50..150]);
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.requests(), vec![(0, 256)]);

        // Same block again: no further backend traffic.
        let bytes = cache.read_at(10, 50).await.unwrap();
        assert_eq!(&bytes[..], &data[10..60]);
        assert_eq!(backend.calls(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_block_mode_multi_block_assembly() {
        let data = content(1024);
        let backend = CountingReader::new(data.clone());
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, u64::MAX, 16);

        let bytes = cache.read_at(100, 300).await.unwrap();
        assert_eq!(&bytes[..], &data[100..400]);
        assert_eq!(backend.calls(), 2);
        assert_eq!(backend.requests(), vec![(0, 256), (256, 256)]);
    }

    #[tokio::test]
    async fn test_block_entries_cover_exact_block_spans() {
        let data = content(600);
        let backend = CountingReader::new(data.clone());
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, u64::MAX, 16);

        cache.read_at(0, 600).await.unwrap();
        // Blocks 0 and 1 are full-size, block 2 is the 88-byte tail.
        assert_eq!(
            backend.requests(),
            vec![(0, 256), (256, 256), (512, 88)]
        );
        assert_eq!(cache.entry_count().await, 3);
        assert_eq!(cache.cached_bytes().await, 600);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_entry_count() {
        let data = content(2048);
        let backend = CountingReader::new(data.clone());
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, u64::MAX, 2);

        cache.read_at(0, 10).await.unwrap(); // block 0
        cache.read_at(256, 10).await.unwrap(); // block 1
        cache.read_at(512, 10).await.unwrap(); // block 2, evicts block 0
        assert_eq!(backend.calls(), 3);

        cache.read_at(300, 10).await.unwrap(); // block 1 still cached
        assert_eq!(backend.calls(), 3);

        cache.read_at(0, 10).await.unwrap(); // block 0 was evicted
        assert_eq!(backend.calls(), 4);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_byte_bound_eviction() {
        let data = content(4096);
        let backend = CountingReader::new(data.clone());
        // Room for two 256-byte blocks.
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, 512, 100);

        cache.read_at(0, 10).await.unwrap();
        cache.read_at(256, 10).await.unwrap();
        cache.read_at(512, 10).await.unwrap();

        assert!(cache.cached_bytes().await <= 512);
        assert_eq!(cache.entry_count().await, 2);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_range_mode_caches_identical_requests() {
        let data = content(1024);
        let backend = CountingReader::new(data.clone());
        let cache = MemoryCache::new(Arc::clone(&backend));

        let a = cache.read_at(100, 64).await.unwrap();
        let b = cache.read_at(100, 64).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.calls(), 1);

        // A different range is a different key.
        cache.read_at(101, 64).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_block_fetches_once() {
        let data = content(64 * 1024);
        let backend = CountingReader::slow(data.clone(), Duration::from_millis(100));
        let cache = Arc::new(MemoryCache::block_aligned_with(
            Arc::clone(&backend),
            64 * 1024,
            u64::MAX,
            16,
        ));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.read_at(0, 65536).await },
            ));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(backend.calls(), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(&results[0][..], &data[..]);
    }

    #[tokio::test]
    async fn test_error_propagates_and_is_not_cached() {
        let cache = MemoryCache::block_aligned(FailingReader::new(
            ReadError::Network("boom".into()),
            1024,
        ));
        let err = cache.read_at(0, 16).await.unwrap_err();
        assert!(matches!(err, ReadError::Network(_)));
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_eof_reads_are_empty_and_uncached() {
        let data = content(100);
        let backend = CountingReader::new(data);
        let cache = MemoryCache::block_aligned_with(Arc::clone(&backend), 256, u64::MAX, 16);

        assert!(cache.read_at(100, 10).await.unwrap().is_empty());
        assert!(cache.read_at(500, 10).await.unwrap().is_empty());
        assert_eq!(backend.calls(), 0);
    }
}
