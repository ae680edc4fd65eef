//! Reusable scratch buffers for backend reads.
//!
//! Backends fill a scratch buffer from the OS or a response body before
//! handing an immutable [`Bytes`] result upward. Allocating that scratch
//! space per read churns the allocator under tile-style workloads (many
//! small scattered reads), so buffers are pooled in bounded, size-classed
//! freelists instead.
//!
//! Capacities are rounded up to 8 KiB multiples so that reads of similar
//! sizes share a class. Buffers above a ceiling are never pooled; a class
//! that is full discards returned buffers.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

/// Pooled capacities are multiples of this.
pub const BUFFER_ALIGNMENT: usize = 8 * 1024;

/// Buffers smaller than this are not worth pooling.
const MIN_POOLED_CAPACITY: usize = 8 * 1024;

/// Buffers larger than this are returned to the allocator instead.
const MAX_POOLED_CAPACITY: usize = 4 * 1024 * 1024;

/// Default bound on idle buffers kept per size class.
const DEFAULT_MAX_IDLE_PER_CLASS: usize = 16;

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing pool effectiveness.
#[derive(Debug, Default)]
pub struct PoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Buffers allocated fresh.
    pub created: u64,
    /// Borrows served from a freelist.
    pub reused: u64,
    /// Buffers recycled back into a freelist.
    pub returned: u64,
    /// Buffers dropped because they were out of bounds or the class was full.
    pub discarded: u64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Bounded pool of scratch buffers, grouped by rounded capacity.
///
/// A process-wide pool is available via [`BufferPool::global`]; pipelines
/// that want isolation construct their own.
#[derive(Debug)]
pub struct BufferPool {
    shelves: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    max_idle_per_class: usize,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_max_idle(DEFAULT_MAX_IDLE_PER_CLASS)
    }

    /// Create a pool that keeps at most `max_idle_per_class` buffers idle in
    /// each size class.
    pub fn with_max_idle(max_idle_per_class: usize) -> Arc<Self> {
        Arc::new(Self {
            shelves: Mutex::new(HashMap::new()),
            max_idle_per_class,
            stats: PoolStats::default(),
        })
    }

    /// The shared process-wide pool.
    pub fn global() -> &'static Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Round a requested length up to its size class.
    pub fn class_of(len: usize) -> usize {
        let len = len.max(1);
        len.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT
    }

    /// Borrow a buffer with capacity for at least `len` bytes.
    ///
    /// The buffer's contents are unspecified; callers overwrite the prefix
    /// they read into. Dropping the returned handle recycles the buffer.
    pub fn get(self: &Arc<Self>, len: usize) -> PooledBuf {
        let class = Self::class_of(len);
        let recycled = {
            let mut shelves = self.shelves.lock().unwrap();
            shelves.get_mut(&class).and_then(Vec::pop)
        };
        let buf = match recycled {
            Some(buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class]
            }
        };
        PooledBuf {
            pool: Arc::clone(self),
            buf: Some(buf),
            len,
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of idle buffers across all classes.
    pub fn idle(&self) -> usize {
        self.shelves.lock().unwrap().values().map(Vec::len).sum()
    }

    fn recycle(&self, buf: Vec<u8>) {
        let cap = buf.len();
        if cap < MIN_POOLED_CAPACITY || cap > MAX_POOLED_CAPACITY {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut shelves = self.shelves.lock().unwrap();
        let shelf = shelves.entry(cap).or_default();
        if shelf.len() >= self.max_idle_per_class {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            shelf.push(buf);
            self.stats.returned.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Borrowed buffer
// =============================================================================

/// A buffer borrowed from a [`BufferPool`].
///
/// Dereferences to the `len` bytes the caller asked for; the underlying
/// allocation may be larger. Returned to the pool on drop.
pub struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Option<Vec<u8>>,
    len: usize,
}

impl PooledBuf {
    /// The requested length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the visible window, e.g. after a short read at end-of-object.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Copy the first `n` bytes into an immutable [`Bytes`] and recycle the
    /// scratch buffer.
    pub fn freeze(self, n: usize) -> Bytes {
        let n = n.min(self.len);
        Bytes::copy_from_slice(&self.buf.as_ref().unwrap()[..n])
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().unwrap()[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().unwrap()[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
