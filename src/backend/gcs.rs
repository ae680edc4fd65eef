//! Google Cloud Storage backend.
//!
//! Uses the XML API host (`storage.googleapis.com/<bucket>/<object>`) with
//! standard `Range` headers. Authentication is anonymous, a caller-supplied
//! OAuth bearer token, or the GCE metadata server token flow when
//! application-default credentials are requested.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::{with_retry, DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT};
use crate::error::ReadError;
use crate::reader::RangeReader;

const STORAGE_HOST: &str = "storage.googleapis.com";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Renew metadata tokens this long before they expire.
const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(60);

// =============================================================================
// Location
// =============================================================================

/// A parsed GCS object reference: `gs://bucket/object` or
/// `https://storage.googleapis.com/bucket/object`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsLocation {
    pub bucket: String,
    pub object: String,
}

impl GcsLocation {
    pub fn parse(uri: &str) -> Result<Self, ReadError> {
        let url = Url::parse(uri)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?;

        let (bucket, object) = match url.scheme() {
            "gs" => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        ReadError::InvalidArgument(format!("{}: missing bucket", uri))
                    })?
                    .to_string();
                let path = url.path().strip_prefix('/').unwrap_or(url.path());
                (bucket, path.to_string())
            }
            "http" | "https" => {
                let host = url.host_str().unwrap_or_default();
                if host != STORAGE_HOST {
                    return Err(ReadError::InvalidArgument(format!(
                        "{}: expected host {}",
                        uri, STORAGE_HOST
                    )));
                }
                let path = url.path().strip_prefix('/').unwrap_or(url.path());
                let (bucket, object) = path.split_once('/').ok_or_else(|| {
                    ReadError::InvalidArgument(format!("{}: expected /bucket/object", uri))
                })?;
                (bucket.to_string(), object.to_string())
            }
            other => {
                return Err(ReadError::InvalidArgument(format!(
                    "{}: unsupported scheme {}",
                    uri, other
                )))
            }
        };

        if bucket.is_empty() || object.is_empty() || object.ends_with('/') {
            return Err(ReadError::InvalidArgument(format!(
                "{}: no object name (bucket roots and prefixes are not readable)",
                uri
            )));
        }
        let object = urlencoding::decode(&object)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?
            .into_owned();
        Ok(Self { bucket, object })
    }

    fn request_url(&self) -> Result<Url, ReadError> {
        let raw = format!(
            "https://{}/{}/{}",
            STORAGE_HOST,
            self.bucket,
            urlencoding::encode(&self.object).replace("%2F", "/")
        );
        Url::parse(&raw).map_err(|e| ReadError::InvalidArgument(format!("{}: {}", raw, e)))
    }

    pub fn source_id(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// How GCS requests are authenticated.
#[derive(Debug, Clone)]
pub enum GcsAuth {
    /// Public buckets.
    Anonymous,
    /// A caller-supplied OAuth access token.
    BearerToken(String),
    /// Fetch tokens from the GCE/GKE metadata server, the
    /// application-default flow available inside Google Cloud.
    MetadataServer,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

async fn fetch_metadata_token(client: &Client) -> Result<CachedToken, ReadError> {
    let resp = client
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| ReadError::AuthDenied(format!("metadata server unreachable: {}", e)))?;
    if !resp.status().is_success() {
        return Err(ReadError::AuthDenied(format!(
            "metadata server answered {}",
            resp.status()
        )));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| ReadError::AuthDenied(format!("bad metadata token response: {}", e)))?;
    let token: MetadataToken = serde_json::from_slice(&body)
        .map_err(|e| ReadError::AuthDenied(format!("bad metadata token response: {}", e)))?;
    let ttl = Duration::from_secs(token.expires_in)
        .saturating_sub(TOKEN_RENEWAL_MARGIN);
    Ok(CachedToken {
        token: token.access_token,
        expires_at: Instant::now() + ttl,
    })
}

// =============================================================================
// Reader
// =============================================================================

/// Reads byte ranges from a GCS object.
///
/// Size and existence are checked once at construction via `HEAD`; `404`
/// maps to `NotFound`, `401`/`403` to `AuthDenied`. An optional quota
/// project is attached as `x-goog-user-project` on every request.
#[derive(Debug)]
pub struct GcsRangeReader {
    client: Client,
    url: Url,
    auth: GcsAuth,
    quota_project: Option<String>,
    cached_token: Mutex<Option<CachedToken>>,
    size: u64,
    source: String,
    attempts: u32,
}

impl GcsRangeReader {
    /// Connect with default timeout and retry settings.
    pub async fn connect(location: GcsLocation, auth: GcsAuth) -> Result<Self, ReadError> {
        Self::connect_with(location, auth, None, DEFAULT_TIMEOUT, DEFAULT_RETRY_ATTEMPTS).await
    }

    pub async fn connect_with(
        location: GcsLocation,
        auth: GcsAuth,
        quota_project: Option<String>,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Self, ReadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReadError::Network(e.to_string()))?;

        let url = location.request_url()?;
        let source = location.source_id();
        let mut reader = Self {
            client,
            url,
            auth,
            quota_project,
            cached_token: Mutex::new(None),
            size: 0,
            source,
            attempts: attempts.max(1),
        };
        reader.size = reader.resolve_size().await?;
        debug!(source = %reader.source, size = reader.size, "gcs reader connected");
        Ok(reader)
    }

    /// Parse a `gs://` or `storage.googleapis.com` URI and connect.
    pub async fn open(uri: &str, auth: GcsAuth) -> Result<Self, ReadError> {
        Self::connect(GcsLocation::parse(uri)?, auth).await
    }

    async fn bearer_token(&self) -> Result<Option<String>, ReadError> {
        match &self.auth {
            GcsAuth::Anonymous => Ok(None),
            GcsAuth::BearerToken(token) => Ok(Some(token.clone())),
            GcsAuth::MetadataServer => {
                let mut cached = self.cached_token.lock().await;
                if let Some(token) = cached.as_ref() {
                    if token.expires_at > Instant::now() {
                        return Ok(Some(token.token.clone()));
                    }
                }
                let fresh = fetch_metadata_token(&self.client).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(Some(token))
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        range: Option<(u64, u64)>,
    ) -> Result<Response, ReadError> {
        let mut req = self.client.request(method, self.url.clone());
        if let Some((first, last)) = range {
            req = req.header(RANGE, format!("bytes={}-{}", first, last));
        }
        if let Some(token) = self.bearer_token().await? {
            req = req.bearer_auth(token);
        }
        if let Some(project) = &self.quota_project {
            req = req.header("x-goog-user-project", project.as_str());
        }
        req.send()
            .await
            .map_err(|e| ReadError::Network(e.to_string()))
    }

    async fn resolve_size(&self) -> Result<u64, ReadError> {
        with_retry(&self.source, self.attempts, || async {
            let resp = self.request(Method::HEAD, None).await?;
            let status = resp.status();
            if status.is_success() {
                return resp
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        ReadError::Protocol(format!(
                            "{}: object metadata without Content-Length",
                            self.source
                        ))
                    });
            }
            Err(self.classify_failure(status))
        })
        .await
    }

    fn classify_failure(&self, status: StatusCode) -> ReadError {
        match status {
            StatusCode::NOT_FOUND => ReadError::NotFound(self.source.clone()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ReadError::AuthDenied(self.source.clone())
            }
            s if s.is_server_error() => ReadError::Network(format!("{}: {}", self.source, s)),
            s => ReadError::Protocol(format!("{}: unexpected status {}", self.source, s)),
        }
    }
}

#[async_trait]
impl RangeReader for GcsRangeReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        with_retry(&self.source, self.attempts, || async {
            let last = offset + len as u64 - 1;
            let resp = self.request(Method::GET, Some((offset, last))).await?;
            let status = resp.status();
            if status == StatusCode::PARTIAL_CONTENT || status == StatusCode::OK {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| ReadError::Network(e.to_string()))?;
                if body.len() > len {
                    return Err(ReadError::Protocol(format!(
                        "{}: range response of {} bytes exceeds the {} requested",
                        self.source,
                        body.len(),
                        len
                    )));
                }
                return Ok(body);
            }
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(Bytes::new());
            }
            Err(self.classify_failure(status))
        })
        .await
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn source_id(&self) -> &str {
        &self.source
    }
}
