//! Sequential façade over a positional reader.

use std::sync::Arc;

use crate::error::ReadError;
use crate::reader::RangeReader;

/// A read-only, position-tracking byte channel over a [`RangeReader`].
///
/// Each `read` fills the destination from the current cursor and advances
/// it by the bytes delivered; `Ok(0)` signals end-of-object. The channel
/// shares the reader rather than owning it: closing the channel releases
/// nothing but the channel itself, and every call after `close` fails with
/// [`ReadError::Closed`].
pub struct ReaderChannel {
    reader: Arc<dyn RangeReader>,
    position: u64,
    closed: bool,
}

impl ReaderChannel {
    pub fn new(reader: Arc<dyn RangeReader>) -> Self {
        Self {
            reader,
            position: 0,
            closed: false,
        }
    }

    /// Fill `dst` from the cursor, advancing it by the returned count.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, ReadError> {
        self.ensure_open()?;
        if dst.is_empty() {
            return Ok(0);
        }
        if let Some(size) = self.reader.size() {
            if self.position >= size {
                return Ok(0);
            }
        }
        let n = self.reader.read_into(self.position, dst).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Current cursor.
    pub fn position(&self) -> Result<u64, ReadError> {
        self.ensure_open()?;
        Ok(self.position)
    }

    /// Move the cursor. Positions past end-of-object are legal; the next
    /// read simply reports end-of-object.
    pub fn seek(&mut self, position: u64) -> Result<(), ReadError> {
        self.ensure_open()?;
        self.position = position;
        Ok(())
    }

    /// Size of the underlying object, when known.
    pub fn size(&self) -> Result<Option<u64>, ReadError> {
        self.ensure_open()?;
        Ok(self.reader.size())
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Close the channel. Idempotent; the underlying reader stays usable
    /// by other holders.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<(), ReadError> {
        if self.closed {
            Err(ReadError::Closed)
        } else {
            Ok(())
        }
    }
}
