//! Local file backend.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ReadError;
use crate::pool::BufferPool;
use crate::reader::RangeReader;

/// Reads byte ranges from a local file.
///
/// The file is opened read-only once and every read names its absolute
/// offset (`pread` on unix, `seek_read` on windows), so no shared cursor
/// exists and concurrent reads need no locking. Reads run on the blocking
/// thread pool to keep the async runtime responsive on slow disks.
#[derive(Debug)]
pub struct FileRangeReader {
    file: Arc<std::fs::File>,
    size: u64,
    source: String,
    pool: Arc<BufferPool>,
}

impl FileRangeReader {
    /// Open `path` and capture its current size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        Self::open_with_pool(path, Arc::clone(BufferPool::global())).await
    }

    /// Open `path`, borrowing scratch buffers from a caller-owned pool.
    pub async fn open_with_pool(
        path: impl AsRef<Path>,
        pool: Arc<BufferPool>,
    ) -> Result<Self, ReadError> {
        let path = path.as_ref().to_path_buf();
        let (file, size, resolved) =
            tokio::task::spawn_blocking(move || -> Result<_, ReadError> {
                let file = std::fs::File::open(&path)
                    .map_err(|e| annotate(ReadError::from(e), &path))?;
                let meta = file
                    .metadata()
                    .map_err(|e| annotate(ReadError::from(e), &path))?;
                if !meta.is_file() {
                    return Err(ReadError::InvalidArgument(format!(
                        "{}: not a regular file",
                        path.display()
                    )));
                }
                let resolved = path.canonicalize().unwrap_or(path);
                Ok((file, meta.len(), resolved))
            })
            .await
            .map_err(|e| ReadError::Cancelled(e.to_string()))??;

        Ok(Self {
            file: Arc::new(file),
            size,
            source: format!("file://{}", resolved.display()),
            pool,
        })
    }
}

fn annotate(e: ReadError, path: &Path) -> ReadError {
    match e {
        ReadError::NotFound(_) => ReadError::NotFound(path.display().to_string()),
        ReadError::AuthDenied(_) => ReadError::AuthDenied(path.display().to_string()),
        ReadError::Io(msg) => ReadError::Io(format!("{}: {}", path.display(), msg)),
        other => other,
    }
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let file = Arc::clone(&self.file);
        let pool = Arc::clone(&self.pool);
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || -> Result<Bytes, ReadError> {
            let mut buf = pool.get(len);
            let mut filled = 0;
            while filled < len {
                match read_at(&file, &mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ReadError::Io(format!("{}: {}", source, e))),
                }
            }
            Ok(buf.freeze(filled))
        })
        .await
        .map_err(|e| ReadError::Cancelled(e.to_string()))?
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn source_id(&self) -> &str {
        &self.source
    }
}
