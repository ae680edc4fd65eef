//! Shared fixtures: deterministic content, a request-tracking reader, and
//! a local HTTP server that speaks range requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use tokio::time::sleep;

use range_reader::{RangeReader, ReadError};

/// Route tracing output through the test harness when `RUST_LOG` asks for it.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic pseudo-random content, seeded so every test sees the same
/// bytes (splitmix64 over the index).
pub fn test_content(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut state = 42u64;
    while out.len() < len {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        out.extend_from_slice(&z.to_le_bytes());
    }
    out.truncate(len);
    out
}

// =============================================================================
// Tracking reader
// =============================================================================

/// In-memory backend that records every range requested from it.
pub struct TrackingReader {
    data: Bytes,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<(u64, usize)>>,
}

impl TrackingReader {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Self::with_delay(data, Duration::ZERO)
    }

    /// A backend that takes `delay` per read, for contention tests.
    pub fn with_delay(data: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            data: Bytes::from(data),
            delay,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(u64, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeReader for TrackingReader {
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
        "tracking://fixture"
    }
}

// =============================================================================
// Local range server
// =============================================================================

pub struct RangeServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

struct ServerState {
    data: Bytes,
    basic_auth: Option<(String, String)>,
    ignore_range: bool,
    requests: AtomicUsize,
}

impl RangeServer {
    /// URL of the single object the server exposes.
    pub fn url(&self) -> String {
        format!("http://{}/data.bin", self.addr)
    }

    /// Number of requests observed (HEAD and GET alike).
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

/// Serve `data` at `/data.bin` on an ephemeral port.
pub async fn serve(data: Vec<u8>) -> RangeServer {
    serve_with(data, None, false).await
}

/// Same, requiring HTTP basic credentials.
pub async fn serve_basic_auth(data: Vec<u8>, username: &str, password: &str) -> RangeServer {
    serve_with(data, Some((username.to_string(), password.to_string())), false).await
}

/// Same, but the server ignores `Range` and always sends the whole body.
pub async fn serve_ignoring_ranges(data: Vec<u8>) -> RangeServer {
    serve_with(data, None, true).await
}

async fn serve_with(
    data: Vec<u8>,
    basic_auth: Option<(String, String)>,
    ignore_range: bool,
) -> RangeServer {
    init_tracing();
    let state = Arc::new(ServerState {
        data: Bytes::from(data),
        basic_auth,
        ignore_range,
        requests: AtomicUsize::new(0),
    });

    let router = Router::new()
        .route("/data.bin", get(object_handler))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    RangeServer { addr, state }
}

async fn object_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);

    if let Some((user, pass)) = &state.basic_auth {
        let expected = format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", user, pass).as_bytes())
        );
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(header::WWW_AUTHENTICATE, "Basic realm=\"fixture\"")
                .body(Body::empty())
                .unwrap();
        }
    }

    let total = state.data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|_| !state.ignore_range)
        .and_then(parse_range);

    let (status, body, content_range) = match range {
        Some((first, _)) if first >= total => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            Bytes::new(),
            Some(format!("bytes */{}", total)),
        ),
        Some((first, last)) => {
            let last = last.min(total - 1);
            let slice = state.data.slice(first as usize..=last as usize);
            (
                StatusCode::PARTIAL_CONTENT,
                slice,
                Some(format!("bytes {}-{}/{}", first, last, total)),
            )
        }
        None => (StatusCode::OK, state.data.clone(), None),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    let body = if method == Method::HEAD { Bytes::new() } else { body };
    builder.body(Body::from(body)).unwrap()
}

/// Parse `bytes=a-b` (both bounds present, the only form the client sends).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (first, last) = spec.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}
