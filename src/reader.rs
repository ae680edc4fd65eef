use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ReadError;

/// Trait for reading byte ranges from a local or remote resource.
///
/// This abstraction lets callers work with multi-gigabyte objects without
/// downloading them entirely: each read names its absolute offset, so no
/// shared cursor exists and implementations must be safe to call from many
/// tasks concurrently.
///
/// Implementors provide [`read_range_inner`](RangeReader::read_range_inner)
/// and may assume its arguments were already validated and clamped by the
/// provided [`read_at`](RangeReader::read_at) entry point. Decorators
/// (caching, block alignment) wrap an exclusively owned inner reader;
/// dropping the outermost reader tears the whole pipeline down.
#[async_trait]
pub trait RangeReader: Send + Sync + std::fmt::Debug {
    /// Read `len` bytes starting at `offset`.
    ///
    /// Callers go through [`read_at`](RangeReader::read_at) instead; this
    /// method receives a non-empty range already clamped against
    /// [`size`](RangeReader::size) when the size is known. When the size is
    /// unknown, a result shorter than `len` signals end-of-object.
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError>;

    /// Total size of the resource in bytes, when cheaply known.
    ///
    /// Backends that cannot discover a length (an HTTP server without
    /// `HEAD` support, for example) return `None`; caches still work but
    /// tail reads cannot be clipped up front.
    fn size(&self) -> Option<u64>;

    /// A stable, unique identifier for this resource.
    ///
    /// Used for logging and to namespace cache keys, e.g. `s3://bucket/key`
    /// or `file:///data/archive.bin`.
    fn source_id(&self) -> &str;

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// This is the public entry point: it validates the range, clamps it
    /// against the known size, and delegates to
    /// [`read_range_inner`](RangeReader::read_range_inner).
    ///
    /// Returns an empty buffer when `len == 0` or `offset` is at or past
    /// end-of-object; returns `size - offset` bytes when the range sticks
    /// out past the end. A short result otherwise is an error.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let len = clamped_len(offset, len, self.size())?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let bytes = self.read_range_inner(offset, len).await?;
        if bytes.len() > len {
            return Err(ReadError::Protocol(format!(
                "{}: got {} bytes for a {} byte request at offset {}",
                self.source_id(),
                bytes.len(),
                len,
                offset
            )));
        }
        if bytes.len() < len && self.size().is_some() {
            return Err(ReadError::Protocol(format!(
                "{}: truncated range at offset {}: expected {} bytes, got {}",
                self.source_id(),
                offset,
                len,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Read into a caller-supplied buffer, returning the byte count.
    ///
    /// Exactly the returned prefix of `dst` is overwritten; a count shorter
    /// than `dst.len()` only occurs at end-of-object.
    async fn read_into(&self, offset: u64, dst: &mut [u8]) -> Result<usize, ReadError> {
        let bytes = self.read_at(offset, dst.len()).await?;
        dst[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

/// Validate `(offset, len)` against an optionally known size and return the
/// effective length: `0` means the read resolves to empty without touching
/// the backend.
pub(crate) fn clamped_len(
    offset: u64,
    len: usize,
    size: Option<u64>,
) -> Result<usize, ReadError> {
    let end = offset.checked_add(len as u64).ok_or_else(|| {
        ReadError::InvalidArgument(format!("range {}+{} overflows u64", offset, len))
    })?;
    if len == 0 {
        return Ok(0);
    }
    match size {
        Some(size) if offset >= size => Ok(0),
        Some(size) if end > size => Ok((size - offset) as usize),
        _ => Ok(len),
    }
}

#[async_trait]
impl<R: RangeReader + ?Sized> RangeReader for Box<R> {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        (**self).read_range_inner(offset, len).await
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }

    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        (**self).read_at(offset, len).await
    }
}

#[async_trait]
impl<R: RangeReader + ?Sized> RangeReader for std::sync::Arc<R> {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        (**self).read_range_inner(offset, len).await
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }

    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        (**self).read_at(offset, len).await
    }
}
