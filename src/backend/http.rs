//! HTTP/HTTPS backend using range requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use super::{with_retry, DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT};
use crate::error::ReadError;
use crate::reader::RangeReader;

/// When a server ignores `Range` and answers `200 OK`, refuse to buffer a
/// body more than this many times larger than the requested slice.
const FULL_BODY_TOLERANCE: u64 = 16;

// =============================================================================
// Authentication strategies
// =============================================================================

/// How outgoing requests are authenticated.
///
/// A strategy only ever mutates request headers. `Digest` performs the
/// usual challenge round-trip on the first `401` and caches the challenge
/// for subsequent requests; only the RFC 7616 `SHA-256` algorithm is
/// supported.
#[derive(Debug, Clone)]
pub enum HttpAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    ApiKey { header: String, value: String },
    Digest { username: String, password: String },
    Headers(Vec<(String, String)>),
}

impl HttpAuth {
    fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            HttpAuth::None | HttpAuth::Digest { .. } => req,
            HttpAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            HttpAuth::Bearer { token } => req.bearer_auth(token),
            HttpAuth::ApiKey { header, value } => req.header(header.as_str(), value.as_str()),
            HttpAuth::Headers(headers) => headers
                .iter()
                .fold(req, |req, (name, value)| req.header(name.as_str(), value.as_str())),
        }
    }
}

// =============================================================================
// Digest challenge handling (RFC 7616, SHA-256)
// =============================================================================

#[derive(Debug, Clone)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    algorithm: String,
}

/// Split `k1=v1, k2="v2,still v2"` into pairs, honoring quotes.
fn split_challenge_params(s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest.get(end..).unwrap_or("");
        }
        rest = rest.trim_start().strip_prefix(',').unwrap_or(rest).trim_start();
        params.push((key, value));
    }
    params
}

fn parse_digest_challenge(header: &str) -> Option<DigestChallenge> {
    let rest = header.trim();
    if rest.len() < 7 || !rest.as_bytes()[..7].eq_ignore_ascii_case(b"digest ") {
        return None;
    }
    let mut challenge = DigestChallenge {
        realm: String::new(),
        nonce: String::new(),
        opaque: None,
        qop_auth: false,
        algorithm: "MD5".to_string(),
    };
    for (key, value) in split_challenge_params(&rest[7..]) {
        match key.as_str() {
            "realm" => challenge.realm = value,
            "nonce" => challenge.nonce = value,
            "opaque" => challenge.opaque = Some(value),
            "qop" => challenge.qop_auth = value.split(',').any(|q| q.trim() == "auth"),
            "algorithm" => challenge.algorithm = value,
            _ => {}
        }
    }
    if challenge.nonce.is_empty() {
        return None;
    }
    Some(challenge)
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Compute the RFC 7616 `response` parameter for `algorithm=SHA-256`.
fn digest_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: u64,
    cnonce: &str,
) -> String {
    let ha1 = sha256_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = sha256_hex(&format!("{}:{}", method, uri));
    if challenge.qop_auth {
        sha256_hex(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))
    } else {
        sha256_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

fn digest_authorization(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: u64,
    cnonce: &str,
) -> Result<String, ReadError> {
    if !challenge.algorithm.eq_ignore_ascii_case("sha-256") {
        return Err(ReadError::AuthDenied(format!(
            "digest algorithm {} not supported",
            challenge.algorithm
        )));
    }
    let response = digest_response(username, password, method, uri, challenge, nc, cnonce);
    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
         algorithm=SHA-256, response=\"{}\"",
        username, challenge.realm, challenge.nonce, uri, response
    );
    if challenge.qop_auth {
        header.push_str(&format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    Ok(header)
}

fn fresh_cnonce(nonce: &str, nc: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    sha256_hex(&format!("{}:{}:{}", nonce, nc, now))[..16].to_string()
}

// =============================================================================
// Reader
// =============================================================================

/// Reads byte ranges over HTTP with `Range: bytes=a-b` requests.
///
/// The object size is resolved once at construction: `HEAD` first, falling
/// back to a one-byte ranged `GET` whose `Content-Range` carries the total.
/// Servers that expose neither leave the size unknown, which downstream
/// layers tolerate (tail reads come back short instead of clipped).
#[derive(Debug)]
pub struct HttpRangeReader {
    client: Client,
    url: Url,
    auth: HttpAuth,
    size: Option<u64>,
    source: String,
    attempts: u32,
    digest_challenge: Mutex<Option<DigestChallenge>>,
    digest_nc: AtomicU64,
}

/// Builder for [`HttpRangeReader`].
pub struct HttpReaderBuilder {
    url: Url,
    auth: HttpAuth,
    timeout: Duration,
    attempts: u32,
    client: Option<Client>,
}

impl HttpReaderBuilder {
    pub fn auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Per-request timeout, the backend-level cancellation bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts for transient failures (minimum 1).
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Use a caller-provided client instead of building one.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Resolve the object size and produce the reader.
    pub async fn connect(self) -> Result<HttpRangeReader, ReadError> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| ReadError::Network(e.to_string()))?,
        };
        let source = self.url.to_string();
        let mut reader = HttpRangeReader {
            client,
            url: self.url,
            auth: self.auth,
            size: None,
            source,
            attempts: self.attempts,
            digest_challenge: Mutex::new(None),
            digest_nc: AtomicU64::new(0),
        };
        reader.size = reader.resolve_size().await?;
        debug!(source = %reader.source, size = ?reader.size, "http reader connected");
        Ok(reader)
    }
}

impl HttpRangeReader {
    pub fn builder(url: &str) -> Result<HttpReaderBuilder, ReadError> {
        let url = Url::parse(url)
            .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ReadError::InvalidArgument(format!(
                "{}: expected an http(s) URL",
                url
            )));
        }
        Ok(HttpReaderBuilder {
            url,
            auth: HttpAuth::None,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_RETRY_ATTEMPTS,
            client: None,
        })
    }

    /// Open `url` without authentication and with default settings.
    pub async fn open(url: &str) -> Result<Self, ReadError> {
        Self::builder(url)?.connect().await
    }

    fn request_uri(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// Issue one request, transparently answering a Digest challenge.
    async fn send(
        &self,
        method: Method,
        range: Option<(u64, u64)>,
    ) -> Result<Response, ReadError> {
        let is_digest = matches!(self.auth, HttpAuth::Digest { .. });
        let mut answered_challenge = false;
        loop {
            let mut req = self.client.request(method.clone(), self.url.clone());
            if let Some((first, last)) = range {
                req = req.header(RANGE, format!("bytes={}-{}", first, last));
            }
            req = self.auth.apply(req);
            if is_digest {
                let challenge = self.digest_challenge.lock().unwrap().clone();
                if let Some(challenge) = challenge {
                    req = req.header(
                        AUTHORIZATION,
                        self.digest_header(&method, &challenge)?,
                    );
                }
            }

            let resp = req.send().await.map_err(classify_transport)?;

            if resp.status() == StatusCode::UNAUTHORIZED && is_digest && !answered_challenge {
                let challenge = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_digest_challenge);
                if let Some(challenge) = challenge {
                    *self.digest_challenge.lock().unwrap() = Some(challenge);
                    answered_challenge = true;
                    continue;
                }
            }
            return Ok(resp);
        }
    }

    fn digest_header(
        &self,
        method: &Method,
        challenge: &DigestChallenge,
    ) -> Result<String, ReadError> {
        let HttpAuth::Digest { username, password } = &self.auth else {
            unreachable!("digest header requested for non-digest auth");
        };
        let nc = self.digest_nc.fetch_add(1, Ordering::SeqCst) + 1;
        let cnonce = fresh_cnonce(&challenge.nonce, nc);
        digest_authorization(
            username,
            password,
            method.as_str(),
            &self.request_uri(),
            challenge,
            nc,
            &cnonce,
        )
    }

    async fn resolve_size(&self) -> Result<Option<u64>, ReadError> {
        let head = with_retry(&self.source, self.attempts, || async {
            let resp = self.send(Method::HEAD, None).await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(content_length_of(&resp));
            }
            match status {
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    Err(ReadError::NotFound(self.source.clone()))
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    Err(ReadError::AuthDenied(self.source.clone()))
                }
                s if s.is_server_error() => {
                    Err(ReadError::Network(format!("{}: {}", self.source, s)))
                }
                // HEAD not supported; the ranged probe below still works.
                _ => Ok(None),
            }
        })
        .await;

        match head {
            Ok(Some(len)) => return Ok(Some(len)),
            Ok(None) => {}
            Err(e @ (ReadError::NotFound(_) | ReadError::AuthDenied(_))) => return Err(e),
            Err(_) => {}
        }

        with_retry(&self.source, self.attempts, || async {
            let resp = self.send(Method::GET, Some((0, 0))).await?;
            let status = resp.status();
            match status {
                StatusCode::PARTIAL_CONTENT => Ok(resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total)),
                StatusCode::OK => Ok(content_length_of(&resp)),
                StatusCode::RANGE_NOT_SATISFIABLE => Ok(resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total)),
                _ => Err(self.classify_failure(status)),
            }
        })
        .await
    }

    fn classify_failure(&self, status: StatusCode) -> ReadError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => ReadError::NotFound(self.source.clone()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ReadError::AuthDenied(self.source.clone())
            }
            s if s.is_server_error() => {
                ReadError::Network(format!("{}: {}", self.source, s))
            }
            s => ReadError::Protocol(format!("{}: unexpected status {}", self.source, s)),
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ReadError {
    if e.is_timeout() {
        ReadError::Network(format!("timeout: {}", e))
    } else {
        ReadError::Network(e.to_string())
    }
}

fn content_length_of(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Extract the total from `Content-Range: bytes 0-0/12345` (or `bytes */12345`).
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let total = rest.rsplit('/').next()?;
    total.parse().ok()
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_range_inner(&self, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        with_retry(&self.source, self.attempts, || async {
            let last = offset + len as u64 - 1;
            let resp = self.send(Method::GET, Some((offset, last))).await?;
            let status = resp.status();
            match status {
                StatusCode::PARTIAL_CONTENT => {
                    let body = resp.bytes().await.map_err(classify_transport)?;
                    if body.len() > len {
                        return Err(ReadError::Protocol(format!(
                            "{}: range response of {} bytes exceeds the {} requested",
                            self.source,
                            body.len(),
                            len
                        )));
                    }
                    Ok(body)
                }
                // The server ignored the range header; slice locally, but
                // refuse to buffer wildly more than was asked for.
                StatusCode::OK => {
                    if let Some(total) = content_length_of(&resp) {
                        if total > len as u64 * FULL_BODY_TOLERANCE {
                            return Err(ReadError::Protocol(format!(
                                "{}: server ignored range and would send {} bytes for a {} byte request",
                                self.source, total, len
                            )));
                        }
                    }
                    let body = resp.bytes().await.map_err(classify_transport)?;
                    if body.len() as u64 > len as u64 * FULL_BODY_TOLERANCE {
                        return Err(ReadError::Protocol(format!(
                            "{}: server ignored range and sent {} bytes for a {} byte request",
                            self.source,
                            body.len(),
                            len
                        )));
                    }
                    let start = (offset as usize).min(body.len());
                    let end = (start + len).min(body.len());
                    Ok(body.slice(start..end))
                }
                StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
                s => Err(self.classify_failure(s)),
            }
        })
        .await
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn source_id(&self) -> &str {
        &self.source
    }
}
