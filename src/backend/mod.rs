//! Backend readers: the components that perform actual I/O.
//!
//! Every backend exposes the same [`RangeReader`](crate::RangeReader)
//! surface and resolves the object size up front, so decorators above can
//! clip tail reads. Remote backends classify failures into the shared error
//! taxonomy and retry transient ones with bounded exponential backoff.

mod azure;
mod file;
mod gcs;
mod http;
mod s3;

pub use azure::{AzureAuth, AzureBlobRangeReader, AzureLocation};
pub use file::FileRangeReader;
pub use gcs::{GcsAuth, GcsLocation, GcsRangeReader};
pub use http::{HttpAuth, HttpRangeReader, HttpReaderBuilder};
pub use s3::{build_s3_client, S3Auth, S3Location, S3RangeReader};

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::ReadError;

/// Default number of attempts for transient failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default per-request timeout for remote backends.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// First backoff delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run `op` up to `attempts` times, sleeping with exponential backoff
/// between retryable failures. Non-retryable errors surface immediately;
/// an exhausted budget surfaces [`ReadError::Network`].
pub(crate) async fn with_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    op: F,
) -> Result<T, ReadError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ReadError>>,
{
    let attempts = attempts.max(1);
    let mut delay = RETRY_BASE_DELAY;
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!(what, attempt, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                delay *= 2;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(ReadError::Network(format!(
        "{}: retries exhausted: {}",
        what,
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}
