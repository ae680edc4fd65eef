//! Block alignment for cache-friendly request shapes.
//!
//! Scattered small reads are widened to block boundaries before they reach
//! the layer below, so a cache sitting underneath only ever sees ranges that
//! start and end on block edges. Without this, caching arbitrary ranges
//! explodes into overlapping entries that never hit.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ReadError;
use crate::reader::RangeReader;

/// Default alignment for in-memory paths: 64 KiB.
pub const DEFAULT_ALIGNMENT_BLOCK_SIZE: usize = 64 * 1024;

/// Decorator that rounds every request out to block boundaries.
///
/// A request for `(offset, len)` becomes a single inner read covering
/// `[offset - offset % bs, round_up(offset + len, bs))`, clipped to the
/// object size when known; the caller receives the zero-copy sub-slice they
/// asked for. Place this between a cache and its delegate so the cache's
/// misses are aligned; the aligner itself holds no state and adds no
/// synchronization.
#[derive(Debug)]
pub struct BlockAligned<R> {
    inner: R,
    block_size: usize,
}

impl<R: RangeReader> BlockAligned<R> {
    /// Wrap `inner` with the default 64 KiB alignment.
    pub fn new(inner: R) -> Self {
        Self::with_block_size(inner, DEFAULT_ALIGNMENT_BLOCK_SIZE)
    }

    /// Wrap `inner`, aligning to `block_size` bytes.
    ///
    /// # Panics
    /// Panics if `block_size` is zero. Powers of two keep the arithmetic
    /// cheap but are not required.
    pub fn with_block_size(inner: R, block_size: usize) -> Self {
        assert!(block_size > 0, "block_size must be non-zero");
        Self { inner, block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The wrapped reader.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: RangeReader> RangeReader for BlockAligned<R> {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let bs = self.block_size as u64;
        let first = offset - offset % bs;
        let mut last = (offset + len as u64).div_ceil(bs) * bs;
        if let Some(size) = self.inner.size() {
            last = last.min(size).max(first);
        }

        let aligned = self.inner.read_at(first, (last - first) as usize).await?;

        let lead = (offset - first) as usize;
        if aligned.len() <= lead {
            // Unknown object size and the request started past EOF.
            return Ok(Bytes::new());
        }
        let end = (lead + len).min(aligned.len());
        Ok(aligned.slice(lead..end))
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        self.inner.source_id()
    }
}
