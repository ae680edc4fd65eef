//! Mock readers shared by the crate's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use crate::error::ReadError;
use crate::reader::RangeReader;

/// Deterministic test content.
pub(crate) fn content(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

/// In-memory reader backed by a byte vector.
#[derive(Debug)]
pub(crate) struct VecReader {
    data: Bytes,
    id: String,
    report_size: bool,
}

impl VecReader {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            id: "mem://test".to_string(),
            report_size: true,
        }
    }

    /// Pretend the size is unknown, like a header-less HTTP stream.
    pub(crate) fn sizeless(mut self) -> Self {
        self.report_size = false;
        self
    }
}

#[async_trait]
impl RangeReader for VecReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> Option<u64> {
        self.report_size.then(|| self.data.len() as u64)
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

/// Reader that records every range requested from it, with an optional
/// per-read delay for exercising in-flight coalescing.
#[derive(Debug)]
pub(crate) struct CountingReader {
    data: Bytes,
    id: String,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<(u64, usize)>>,
}

impl CountingReader {
    pub(crate) fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(data),
            id: "counting://test".to_string(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn slow(data: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(data),
            id: "counting://slow".to_string(),
            delay,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<(u64, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeReader for CountingReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((offset, len));
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

/// Reader that always fails, for error propagation tests.
#[derive(Debug)]
pub(crate) struct FailingReader {
    pub(crate) error: ReadError,
    size: u64,
}

impl FailingReader {
    pub(crate) fn new(error: ReadError, size: u64) -> Self {
        Self { error, size }
    }
}

#[async_trait]
impl RangeReader for FailingReader {
    async fn read_range_inner(&self, _offset: u64, _len: usize) -> Result<Bytes, ReadError> {
        Err(self.error.clone())
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn source_id(&self) -> &str {
        "failing://test"
    }
}
