use thiserror::Error;

/// Errors surfaced by range readers and their decorators.
///
/// Variants carry rendered messages rather than source errors so that a
/// single result can be fanned out to every waiter of a coalesced fetch
/// (see [`crate::cache::SingleFlight`]), which requires `Clone`.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// Malformed URI, bad parameter, or an arithmetically impossible range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Object, file, bucket, or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials missing, rejected, or insufficient.
    #[error("access denied: {0}")]
    AuthDenied(String),

    /// Connection failures, DNS errors, timeouts, and 5xx responses that
    /// survived the retry budget.
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered, but inconsistently: wrong content length,
    /// truncated range, unparseable Content-Range.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local filesystem error in the file backend or the disk cache.
    #[error("i/o error: {0}")]
    Io(String),

    /// The operation was cancelled, either by the caller or because the
    /// task performing a coalesced fetch went away.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No provider accepts the URI, or the matching provider is disabled.
    #[error("no backend available: {0}")]
    Unavailable(String),

    /// The sequential channel adapter was used after `close()`.
    #[error("channel is closed")]
    Closed,
}

impl ReadError {
    /// Whether a backend may retry the failed operation.
    ///
    /// Validation failures, missing objects, and rejected credentials are
    /// never retried; transient transport and server failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReadError::Network(_) | ReadError::Protocol(_))
    }
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ReadError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => ReadError::AuthDenied(e.to_string()),
            _ => ReadError::Io(e.to_string()),
        }
    }
}
