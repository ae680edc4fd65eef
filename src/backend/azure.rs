//! Azure Blob Storage backend.
//!
//! Talks to the Blob REST surface directly: ranged `GET` with `x-ms-range`,
//! blob properties via `HEAD`. Authentication is anonymous, SAS token, or
//! SharedKey request signing (HMAC-SHA256 over the canonical string).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Method, Response, StatusCode};
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::{with_retry, DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT};
use crate::error::ReadError;
use crate::reader::RangeReader;

const AZURE_API_VERSION: &str = "2021-08-06";

const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

// =============================================================================
// Location
// =============================================================================

/// A parsed Azure blob reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureLocation {
    /// Blob service endpoint, e.g. `https://acct.blob.core.windows.net`.
    pub endpoint: String,
    pub account: String,
    pub container: String,
    pub blob: String,
}

impl AzureLocation {
    /// Parse `https://<account>.blob.<suffix>/<container>/<blob>`.
    pub fn parse(uri: &str) -> Result<Self, ReadError> {
        let url = Url::parse(uri)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ReadError::InvalidArgument(format!("{}: missing host", uri)))?;

        let (account, rest) = host.split_once('.').ok_or_else(|| {
            ReadError::InvalidArgument(format!("{}: not a blob endpoint", uri))
        })?;
        if !rest.starts_with("blob.") {
            return Err(ReadError::InvalidArgument(format!(
                "{}: not a blob endpoint",
                uri
            )));
        }

        let path = url.path().strip_prefix('/').unwrap_or(url.path());
        let (container, blob) = path.split_once('/').ok_or_else(|| {
            ReadError::InvalidArgument(format!("{}: expected /container/blob", uri))
        })?;
        if container.is_empty() || blob.is_empty() || blob.ends_with('/') {
            return Err(ReadError::InvalidArgument(format!(
                "{}: expected /container/blob",
                uri
            )));
        }
        let blob = urlencoding::decode(blob)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?
            .into_owned();

        Ok(Self {
            endpoint: format!("{}://{}", url.scheme(), host),
            account: account.to_string(),
            container: container.to_string(),
            blob,
        })
    }

    /// Reference a blob on the public Azure endpoint.
    pub fn from_parts(account: &str, container: &str, blob: &str) -> Self {
        Self {
            endpoint: format!("https://{}.blob.{}", account, DEFAULT_ENDPOINT_SUFFIX),
            account: account.to_string(),
            container: container.to_string(),
            blob: blob.to_string(),
        }
    }

    /// Reference a blob behind an explicit endpoint (Azurite, sovereign
    /// clouds, private links).
    pub fn with_endpoint(endpoint: &str, account: &str, container: &str, blob: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: account.to_string(),
            container: container.to_string(),
            blob: blob.to_string(),
        }
    }

    fn request_url(&self) -> Result<Url, ReadError> {
        let raw = format!(
            "{}/{}/{}",
            self.endpoint,
            self.container,
            urlencoding::encode(&self.blob).replace("%2F", "/")
        );
        Url::parse(&raw).map_err(|e| ReadError::InvalidArgument(format!("{}: {}", raw, e)))
    }

    /// The resource component of the SharedKey canonical string.
    fn canonical_resource(&self) -> String {
        format!("/{}/{}/{}", self.account, self.container, self.blob)
    }

    pub fn source_id(&self) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, self.blob)
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// How blob requests are authenticated.
#[derive(Debug, Clone)]
pub enum AzureAuth {
    /// Public containers.
    Anonymous,
    /// A shared access signature, with or without its leading `?`.
    SasToken(String),
    /// The account's shared key (base64), used to sign every request.
    AccountKey(String),
}

/// Split a storage connection string into the blob endpoint and credential.
///
/// Recognizes `AccountName`, `AccountKey`, `SharedAccessSignature`,
/// `BlobEndpoint`, and `EndpointSuffix`; other fields are ignored.
pub fn parse_connection_string(s: &str) -> Result<(String, String, AzureAuth), ReadError> {
    let mut account = None;
    let mut key = None;
    let mut sas = None;
    let mut blob_endpoint = None;
    let mut suffix = DEFAULT_ENDPOINT_SUFFIX.to_string();

    for field in s.split(';').filter(|f| !f.trim().is_empty()) {
        let Some((name, value)) = field.split_once('=') else {
            continue;
        };
        match name.trim() {
            "AccountName" => account = Some(value.trim().to_string()),
            // The key itself is base64 and may contain '='.
            "AccountKey" => key = Some(field[field.find('=').unwrap() + 1..].to_string()),
            "SharedAccessSignature" => {
                sas = Some(field[field.find('=').unwrap() + 1..].to_string())
            }
            "BlobEndpoint" => blob_endpoint = Some(value.trim().trim_end_matches('/').to_string()),
            "EndpointSuffix" => suffix = value.trim().to_string(),
            _ => {}
        }
    }

    let account = account.ok_or_else(|| {
        ReadError::InvalidArgument("connection string has no AccountName".to_string())
    })?;
    let endpoint =
        blob_endpoint.unwrap_or_else(|| format!("https://{}.blob.{}", account, suffix));
    let auth = if let Some(key) = key {
        AzureAuth::AccountKey(key)
    } else if let Some(sas) = sas {
        AzureAuth::SasToken(sas)
    } else {
        AzureAuth::Anonymous
    };
    Ok((account, endpoint, auth))
}

/// Build the SharedKey string-to-sign for a bodyless request.
///
/// The eleven standard header fields are empty for `GET`/`HEAD`; the range
/// travels in `x-ms-range`, which lands in the canonicalized headers.
fn string_to_sign(method: &str, ms_headers: &[(String, String)], resource: &str) -> String {
    let mut headers: Vec<_> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    headers.sort();

    let mut out = format!("{}\n\n\n\n\n\n\n\n\n\n\n\n", method);
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(&value);
        out.push('\n');
    }
    out.push_str(resource);
    out
}

fn shared_key_signature(account_key_b64: &str, payload: &str) -> Result<String, ReadError> {
    let key = BASE64.decode(account_key_b64).map_err(|e| {
        ReadError::InvalidArgument(format!("account key is not valid base64: {}", e))
    })?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| ReadError::InvalidArgument(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// RFC 1123 timestamp for the `x-ms-date` header, e.g.
/// `Tue, 01 Aug 2026 12:00:00 GMT`.
fn format_rfc1123(t: SystemTime) -> String {
    const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (hour, min, sec) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let weekday = WEEKDAYS[(days % 7) as usize];

    // Civil-from-days, Gregorian calendar.
    let z = days as i64 + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday,
        day,
        MONTHS[(month - 1) as usize],
        year,
        hour,
        min,
        sec
    )
}

// =============================================================================
// Reader
// =============================================================================

/// Reads byte ranges from an Azure blob.
///
/// Blob size and existence are checked once at construction via the blob
/// properties call; `BlobNotFound` maps to `NotFound`, 401/403 to
/// `AuthDenied`. Transient failures are retried with bounded backoff.
#[derive(Debug)]
pub struct AzureBlobRangeReader {
    client: Client,
    location: AzureLocation,
    url: Url,
    auth: AzureAuth,
    size: u64,
    source: String,
    attempts: u32,
}

impl AzureBlobRangeReader {
    /// Connect with default timeout and retry settings.
    pub async fn connect(location: AzureLocation, auth: AzureAuth) -> Result<Self, ReadError> {
        Self::connect_with(location, auth, DEFAULT_TIMEOUT, DEFAULT_RETRY_ATTEMPTS).await
    }

    pub async fn connect_with(
        location: AzureLocation,
        auth: AzureAuth,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Self, ReadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReadError::Network(e.to_string()))?;

        let mut url = location.request_url()?;
        if let AzureAuth::SasToken(sas) = &auth {
            url.set_query(Some(sas.trim_start_matches('?')));
        }

        let source = location.source_id();
        let mut reader = Self {
            client,
            location,
            url,
            auth,
            size: 0,
            source,
            attempts: attempts.max(1),
        };
        reader.size = reader.resolve_size().await?;
        debug!(source = %reader.source, size = reader.size, "azure reader connected");
        Ok(reader)
    }

    /// Parse a `https://<account>.blob...` URI and connect.
    pub async fn open(uri: &str, auth: AzureAuth) -> Result<Self, ReadError> {
        Self::connect(AzureLocation::parse(uri)?, auth).await
    }

    /// Connect using a storage connection string.
    pub async fn from_connection_string(
        connection_string: &str,
        container: &str,
        blob: &str,
    ) -> Result<Self, ReadError> {
        let (account, endpoint, auth) = parse_connection_string(connection_string)?;
        let location = AzureLocation::with_endpoint(&endpoint, &account, container, blob);
        Self::connect(location, auth).await
    }

    async fn request(
        &self,
        method: Method,
        range: Option<(u64, u64)>,
    ) -> Result<Response, ReadError> {
        let mut ms_headers = vec![
            ("x-ms-date".to_string(), format_rfc1123(SystemTime::now())),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        if let Some((first, last)) = range {
            ms_headers.push(("x-ms-range".to_string(), format!("bytes={}-{}", first, last)));
        }

        let mut req = self.client.request(method.clone(), self.url.clone());
        for (name, value) in &ms_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let AzureAuth::AccountKey(key) = &self.auth {
            let payload = string_to_sign(
                method.as_str(),
                &ms_headers,
                &self.location.canonical_resource(),
            );
            let signature = shared_key_signature(key, &payload)?;
            req = req.header(
                AUTHORIZATION,
                format!("SharedKey {}:{}", self.location.account, signature),
            );
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
                            "{}: blob properties without Content-Length",
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
impl RangeReader for AzureBlobRangeReader {
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
