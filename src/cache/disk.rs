//! Bounded on-disk block cache that survives process restarts.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{CacheStats, CacheStatsSnapshot, SingleFlight};
use crate::error::ReadError;
use crate::pool::BufferPool;
use crate::reader::RangeReader;

/// Default block size for on-disk caching: 1 MiB.
pub const DEFAULT_DISK_BLOCK_SIZE: usize = 1024 * 1024;

/// Default on-disk byte bound: 1 GiB.
pub const DEFAULT_DISK_MAX_BYTES: u64 = 1024 * 1024 * 1024;

const BLOCK_SUFFIX: &str = "blk";
const TMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    len: u64,
    last_access: u64,
}

struct Index {
    entries: HashMap<String, DiskEntry>,
    total_bytes: u64,
}

/// On-disk block cache decorator.
///
/// Blocks are stored as individual files named by a SHA-256 of
/// `(source_id, block_index, block_size)`, fanned out over two directory
/// levels: `<dir>/ab/cd/abcd….blk`. The in-memory index is rebuilt by
/// scanning the directory on open, so a cache directory outlives the
/// process that filled it.
///
/// Writers stage into a temporary sibling and atomically rename it into
/// place; the rename is the commit point, and readers only ever open
/// committed files. Per-key single-flight means a block is fetched and
/// written at most once however many tasks miss on it concurrently.
/// Filesystem trouble while writing is logged and swallowed: the read
/// still succeeds, the cache just stays cold for that block.
///
/// Eviction is LRU by last access until total on-disk bytes fit the bound.
/// A file whose length disagrees with the index is deleted and re-fetched.
#[derive(Debug)]
pub struct DiskCache<R> {
    inner: R,
    dir: PathBuf,
    block_size: usize,
    max_bytes: u64,
    index: RwLock<Index>,
    flights: SingleFlight<u64>,
    stats: CacheStats,
    pool: Arc<BufferPool>,
}

impl<R: RangeReader> DiskCache<R> {
    /// Open (or reopen) a cache in `dir` with default bounds.
    pub async fn open(inner: R, dir: impl Into<PathBuf>) -> Result<Self, ReadError> {
        Self::open_with(inner, dir, DEFAULT_DISK_MAX_BYTES, DEFAULT_DISK_BLOCK_SIZE).await
    }

    /// Open (or reopen) a cache in `dir`.
    ///
    /// Creates the directory if needed and rebuilds the index from the
    /// block files already present. Stale temporary files from an
    /// interrupted writer are removed.
    ///
    /// # Panics
    /// Panics if `block_size` is zero.
    pub async fn open_with(
        inner: R,
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        block_size: usize,
    ) -> Result<Self, ReadError> {
        assert!(block_size > 0, "block_size must be non-zero");
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ReadError::Io(format!("create {}: {}", dir.display(), e)))?;

        let index = scan(&dir).await?;
        debug!(
            dir = %dir.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes,
            "disk cache opened"
        );

        let cache = Self {
            inner,
            dir,
            block_size,
            max_bytes,
            index: RwLock::new(index),
            flights: SingleFlight::new(),
            stats: CacheStats::default(),
            pool: Arc::clone(BufferPool::global()),
        };
        // A reopened directory may already exceed the configured bound.
        cache.evict_to_bound().await;
        Ok(cache)
    }

    /// The wrapped reader.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Total bytes currently committed on disk.
    pub async fn disk_bytes(&self) -> u64 {
        self.index.read().await.total_bytes
    }

    /// Number of committed block files.
    pub async fn entry_count(&self) -> usize {
        self.index.read().await.entries.len()
    }

    fn key_of(&self, block_idx: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.source_id().as_bytes());
        hasher.update(b"|");
        hasher.update(block_idx.to_be_bytes());
        hasher.update(b"|");
        hasher.update((self.block_size as u64).to_be_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_of(&self, hash: &str) -> PathBuf {
        self.dir
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}.{}", hash, BLOCK_SUFFIX))
    }

    /// Length a block should have, given the (optionally) known size.
    fn expected_block_len(&self, block_idx: u64) -> usize {
        let offset = block_idx * self.block_size as u64;
        match self.inner.size() {
            Some(size) => (self.block_size as u64).min(size.saturating_sub(offset)) as usize,
            None => self.block_size,
        }
    }

    async fn block(&self, block_idx: u64) -> Result<Bytes, ReadError> {
        let hash = self.key_of(block_idx);

        if let Some(bytes) = self.read_committed(&hash, block_idx).await? {
            self.stats.record_hit();
            return Ok(bytes);
        }

        self.flights
            .run(block_idx, || async {
                // The previous leader may have committed while we waited for
                // the slot.
                if let Some(bytes) = self.read_committed(&hash, block_idx).await? {
                    self.stats.record_hit();
                    return Ok(bytes);
                }

                let offset = block_idx * self.block_size as u64;
                let len = self.expected_block_len(block_idx);
                if len == 0 {
                    return Ok(Bytes::new());
                }

                let started = Instant::now();
                let bytes = self.inner.read_at(offset, len).await?;
                self.stats.record_miss(started.elapsed());

                if !bytes.is_empty() {
                    self.commit(&hash, &bytes).await;
                }
                Ok(bytes)
            })
            .await
    }

    /// Read a committed block file, verifying its length. Corrupt or
    /// vanished files are dropped from the index so the caller re-fetches.
    async fn read_committed(
        &self,
        hash: &str,
        block_idx: u64,
    ) -> Result<Option<Bytes>, ReadError> {
        let entry = match self.index.read().await.entries.get(hash) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };

        let expected = self.expected_block_len(block_idx) as u64;
        if self.inner.size().is_some() && entry.len != expected {
            warn!(
                path = %entry.path.display(),
                found = entry.len,
                expected,
                "dropping block file with unexpected length"
            );
            self.forget(hash).await;
            return Ok(None);
        }

        match read_file(&self.pool, &entry.path, entry.len as usize).await {
            Ok(bytes) => {
                let mut index = self.index.write().await;
                if let Some(entry) = index.entries.get_mut(hash) {
                    entry.last_access = epoch_millis();
                }
                Ok(Some(bytes))
            }
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "dropping unreadable block file");
                self.forget(hash).await;
                Ok(None)
            }
        }
    }

    /// Write a block through a temp sibling and rename it into place.
    /// Best-effort: failure leaves the cache cold but the read succeeds.
    async fn commit(&self, hash: &str, bytes: &Bytes) {
        let path = self.path_of(hash);
        let tmp = path.with_extension(TMP_SUFFIX);

        let result: std::io::Result<()> = async {
            tokio::fs::create_dir_all(path.parent().unwrap()).await?;
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        match result {
            Ok(()) => {
                let mut index = self.index.write().await;
                let len = bytes.len() as u64;
                if let Some(old) = index.entries.insert(
                    hash.to_string(),
                    DiskEntry {
                        path,
                        len,
                        last_access: epoch_millis(),
                    },
                ) {
                    index.total_bytes -= old.len;
                }
                index.total_bytes += len;
                drop(index);
                self.evict_to_bound().await;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "disk cache write failed");
                let _ = tokio::fs::remove_file(&tmp).await;
            }
        }
    }

    async fn forget(&self, hash: &str) {
        let removed = {
            let mut index = self.index.write().await;
            let removed = index.entries.remove(hash);
            if let Some(ref entry) = removed {
                index.total_bytes -= entry.len;
            }
            removed
        };
        if let Some(entry) = removed {
            let _ = tokio::fs::remove_file(&entry.path).await;
        }
    }

    /// Remove least-recently-used blocks until the byte bound holds.
    async fn evict_to_bound(&self) {
        let mut victims = Vec::new();
        {
            let mut index = self.index.write().await;
            while index.total_bytes > self.max_bytes {
                let oldest = index
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(key) => {
                        if let Some(entry) = index.entries.remove(&key) {
                            index.total_bytes -= entry.len;
                            victims.push(entry.path);
                        }
                    }
                    None => break,
                }
            }
        }
        if !victims.is_empty() {
            self.stats.record_evictions(victims.len() as u64);
            for path in victims {
                debug!(path = %path.display(), "evicting block file");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
}

#[async_trait]
impl<R: RangeReader> RangeReader for DiskCache<R> {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let bs = self.block_size as u64;
        let start_block = offset / bs;
        let end_block = (offset + len as u64 - 1) / bs;

        if start_block == end_block {
            let block = self.block(start_block).await?;
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
            let block = self.block(idx).await?;
            let within = (current % bs) as usize;
            if block.len() <= within {
                break;
            }
            let take = (block.len() - within).min(remaining);
            out.extend_from_slice(&block[within..within + take]);
            current += take as u64;
            remaining -= take;
            if remaining == 0 || block.len() < self.block_size {
                break;
            }
        }
        Ok(out.freeze())
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        self.inner.source_id()
    }
}

// =============================================================================
// Filesystem helpers
// =============================================================================

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn read_file(
    pool: &Arc<BufferPool>,
    path: &Path,
    len: usize,
) -> Result<Bytes, ReadError> {
    let pool = Arc::clone(pool);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Bytes, ReadError> {
        let meta = std::fs::metadata(&path)?;
        if meta.len() != len as u64 {
            return Err(ReadError::Io(format!(
                "{}: expected {} bytes on disk, found {}",
                path.display(),
                len,
                meta.len()
            )));
        }
        let mut file = std::fs::File::open(&path)?;
        let mut buf = pool.get(len);
        file.read_exact(&mut buf)?;
        Ok(buf.freeze(len))
    })
    .await
    .map_err(|e| ReadError::Cancelled(e.to_string()))?
}

/// Rebuild the index by walking the two-level fan directories.
async fn scan(dir: &Path) -> Result<Index, ReadError> {
    let mut index = Index {
        entries: HashMap::new(),
        total_bytes: 0,
    };

    let mut fan1 = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(_) => return Ok(index),
    };
    while let Ok(Some(level1)) = fan1.next_entry().await {
        if !level1.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let mut fan2 = match tokio::fs::read_dir(level1.path()).await {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        while let Ok(Some(level2)) = fan2.next_entry().await {
            let mut files = match tokio::fs::read_dir(level2.path()).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(BLOCK_SUFFIX) => {}
                    Some(TMP_SUFFIX) => {
                        // Leftover from an interrupted writer.
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    _ => continue,
                }
                let Some(hash) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
                else {
                    continue;
                };
                let Ok(meta) = file.metadata().await else {
                    continue;
                };
                let last_access = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                index.total_bytes += meta.len();
                index.entries.insert(
                    hash,
                    DiskEntry {
                        path,
                        len: meta.len(),
                        last_access,
                    },
                );
            }
        }
    }
    Ok(index)
}
