//! S3 and S3-compatible object store backend.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::ReadError;
use crate::reader::RangeReader;

// =============================================================================
// Location parsing
// =============================================================================

/// A parsed S3 object reference.
///
/// Understands every common spelling:
///
/// - `s3://bucket/key` (default AWS endpoint)
/// - `https://bucket.s3.amazonaws.com/key`,
///   `https://bucket.s3.REGION.amazonaws.com/key` (virtual-hosted)
/// - `https://s3.amazonaws.com/bucket/key`,
///   `https://s3.REGION.amazonaws.com/bucket/key` (AWS path style)
/// - any other `http(s)://HOST[:PORT]/bucket/key`, treated as an
///   S3-compatible custom endpoint (MinIO and friends) in path style
///
/// Keys are URL-decoded. A reference without a key, or with a trailing
/// slash, names a bucket or prefix rather than an object and is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    /// Custom endpoint URL, `None` for AWS proper.
    pub endpoint: Option<String>,
    /// Region when the URI names one.
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
    /// Whether the URI shape requires path-style addressing.
    pub path_style: bool,
}

impl S3Location {
    pub fn parse(uri: &str) -> Result<Self, ReadError> {
        let url = Url::parse(uri)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?;

        match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        ReadError::InvalidArgument(format!("{}: missing bucket", uri))
                    })?
                    .to_string();
                let key = decode_key(uri, url.path())?;
                Ok(Self {
                    endpoint: None,
                    region: None,
                    bucket,
                    key,
                    path_style: false,
                })
            }
            "http" | "https" => Self::parse_http(uri, &url),
            other => Err(ReadError::InvalidArgument(format!(
                "{}: unsupported scheme {}",
                uri, other
            ))),
        }
    }

    fn parse_http(uri: &str, url: &Url) -> Result<Self, ReadError> {
        let host = url
            .host_str()
            .ok_or_else(|| ReadError::InvalidArgument(format!("{}: missing host", uri)))?;

        if let Some((bucket, region)) = parse_amazon_host(host) {
            return match bucket {
                // Virtual-hosted: the bucket is part of the host name.
                Some(bucket) => Ok(Self {
                    endpoint: None,
                    region,
                    bucket,
                    key: decode_key(uri, url.path())?,
                    path_style: false,
                }),
                // AWS path style: /bucket/key.
                None => {
                    let (bucket, key) = split_bucket_path(uri, url.path())?;
                    Ok(Self {
                        endpoint: None,
                        region,
                        bucket,
                        key,
                        path_style: true,
                    })
                }
            };
        }

        // Anything else is an S3-compatible endpoint in path style.
        let (bucket, key) = split_bucket_path(uri, url.path())?;
        let endpoint = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self {
            endpoint: Some(endpoint),
            region: None,
            bucket,
            key,
            path_style: true,
        })
    }

    /// The canonical `s3://bucket/key` form used as a source identifier.
    pub fn source_id(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Recognize `amazonaws.com` hosts. Returns `(bucket, region)` where a
/// `None` bucket means the path-style service host.
fn parse_amazon_host(host: &str) -> Option<(Option<String>, Option<String>)> {
    let rest = host.strip_suffix(".amazonaws.com")?;
    if rest == "s3" {
        return Some((None, None));
    }
    if let Some(region) = rest.strip_prefix("s3.") {
        return Some((None, Some(region.to_string())));
    }
    if let Some(bucket) = rest.strip_suffix(".s3") {
        return Some((Some(bucket.to_string()), None));
    }
    if let Some(idx) = rest.rfind(".s3.") {
        let bucket = rest[..idx].to_string();
        let region = rest[idx + 4..].to_string();
        return Some((Some(bucket), Some(region)));
    }
    None
}

fn decode_key(uri: &str, path: &str) -> Result<String, ReadError> {
    let raw = path.strip_prefix('/').unwrap_or(path);
    if raw.is_empty() || raw.ends_with('/') {
        return Err(ReadError::InvalidArgument(format!(
            "{}: no object key (bucket roots and prefixes are not readable)",
            uri
        )));
    }
    let key = urlencoding::decode(raw)
        .map_err(|e| ReadError::InvalidArgument(format!("{}: bad key encoding: {}", uri, e)))?;
    Ok(key.into_owned())
}

fn split_bucket_path(uri: &str, path: &str) -> Result<(String, String), ReadError> {
    let raw = path.strip_prefix('/').unwrap_or(path);
    let (bucket, key) = raw.split_once('/').ok_or_else(|| {
        ReadError::InvalidArgument(format!("{}: expected /bucket/key", uri))
    })?;
    if bucket.is_empty() {
        return Err(ReadError::InvalidArgument(format!("{}: empty bucket", uri)));
    }
    Ok((bucket.to_string(), decode_key(uri, key)?))
}

// =============================================================================
// Credentials and client construction
// =============================================================================

/// How the S3 client authenticates.
#[derive(Debug, Clone)]
pub enum S3Auth {
    /// The SDK's default provider chain (env, profile, IMDS, ...).
    DefaultChain,
    /// A fixed key pair, e.g. for MinIO.
    Static {
        access_key_id: String,
        secret_access_key: String,
    },
    /// A named profile from the shared config files.
    Profile(String),
    /// Unsigned requests against public buckets.
    Anonymous,
}

/// Build an SDK client for `location`.
///
/// `region` overrides the region parsed from the URI; `force_path_style`
/// is implied by URI shapes that require it.
pub async fn build_s3_client(
    location: &S3Location,
    auth: &S3Auth,
    region: Option<&str>,
    force_path_style: bool,
) -> Client {
    let region = region
        .map(str::to_string)
        .or_else(|| location.region.clone())
        .unwrap_or_else(|| "us-east-1".to_string());

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region))
        .timeout_config(
            aws_config::timeout::TimeoutConfig::builder()
                .operation_timeout(super::DEFAULT_TIMEOUT)
                .build(),
        )
        .retry_config(
            aws_config::retry::RetryConfig::standard()
                .with_max_attempts(super::DEFAULT_RETRY_ATTEMPTS),
        );
    match auth {
        S3Auth::DefaultChain => {}
        S3Auth::Static {
            access_key_id,
            secret_access_key,
        } => {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "range-reader-static",
            ));
        }
        S3Auth::Profile(profile) => {
            loader = loader.profile_name(profile);
        }
        S3Auth::Anonymous => {
            loader = loader.no_credentials();
        }
    }
    let sdk_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = &location.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    if force_path_style || location.path_style {
        builder = builder.force_path_style(true);
    }
    Client::from_conf(builder.build())
}

// =============================================================================
// Reader
// =============================================================================

/// Reads byte ranges from an object in S3 or S3-compatible storage.
///
/// The object size is fetched once at construction via `HeadObject`, which
/// doubles as an existence and permission check: a missing object fails
/// construction with `NotFound`, rejected credentials with `AuthDenied`.
/// The SDK client is thread-safe and retries transient failures itself.
#[derive(Clone, Debug)]
pub struct S3RangeReader {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
    source: String,
}

impl S3RangeReader {
    /// Create a reader for `bucket`/`key` using an existing client.
    pub async fn connect(client: Client, bucket: String, key: String) -> Result<Self, ReadError> {
        let source = format!("s3://{}/{}", bucket, key);
        let head = client
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                classify_sdk_error(&source, not_found, status_of(&e), e.to_string())
            })?;

        let size = head.content_length().unwrap_or(0) as u64;
        debug!(source = %source, size, "s3 reader connected");
        Ok(Self {
            client,
            bucket,
            key,
            size,
            source,
        })
    }

    /// Parse `uri`, build a client for it, and connect.
    pub async fn open(uri: &str, auth: S3Auth) -> Result<Self, ReadError> {
        let location = S3Location::parse(uri)?;
        let client = build_s3_client(&location, &auth, None, false).await;
        Self::connect(client, location.bucket, location.key).await
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn status_of<E>(e: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
    e.raw_response().map(|r| r.status().as_u16())
}

fn classify_sdk_error(
    source: &str,
    not_found: bool,
    status: Option<u16>,
    message: String,
) -> ReadError {
    if not_found
        || status == Some(404)
        || message.contains("NoSuchKey")
        || message.contains("NoSuchBucket")
        || message.contains("NotFound")
    {
        return ReadError::NotFound(source.to_string());
    }
    if status == Some(401)
        || status == Some(403)
        || message.contains("AccessDenied")
        || message.contains("InvalidAccessKeyId")
        || message.contains("SignatureDoesNotMatch")
    {
        return ReadError::AuthDenied(source.to_string());
    }
    ReadError::Network(format!("{}: {}", source, message))
}

#[async_trait]
impl RangeReader for S3RangeReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        // Range headers are inclusive on both ends.
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                classify_sdk_error(&self.source, not_found, status_of(&e), e.to_string())
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| ReadError::Network(format!("{}: {}", self.source, e)))?
            .into_bytes();

        Ok(data)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn source_id(&self) -> &str {
        &self.source
    }
}
