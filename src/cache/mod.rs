//! Caching decorators and the machinery they share.
//!
//! Two cache layers exist: [`MemoryCache`] keeps recently used ranges or
//! blocks in bounded process memory, [`DiskCache`] spills blocks to a
//! bounded on-disk store that survives restarts. Both coalesce concurrent
//! misses through [`SingleFlight`] and report [`CacheStats`].

mod disk;
mod memory;
mod single_flight;

pub use disk::{DiskCache, DEFAULT_DISK_BLOCK_SIZE, DEFAULT_DISK_MAX_BYTES};
pub use memory::{
    MemoryCache, DEFAULT_MEMORY_BLOCK_SIZE, DEFAULT_MEMORY_MAX_BYTES, DEFAULT_MEMORY_MAX_ENTRIES,
};
pub use single_flight::SingleFlight;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Statistics
// =============================================================================

/// Hit/miss/eviction counters kept by each cache decorator.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    load_nanos: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Cumulative wall time spent loading misses from the inner reader.
    pub load_nanos: u64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self, load_time: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.load_nanos
            .fetch_add(load_time.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            load_nanos: self.load_nanos.load(Ordering::Relaxed),
        }
    }
}

impl CacheStatsSnapshot {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
