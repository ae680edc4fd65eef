//! The five builtin providers.

use async_trait::async_trait;
use http::HeaderMap;
use url::Url;

use super::{generic_caching_params, Provider};
use crate::backend::{
    AzureAuth, AzureBlobRangeReader, AzureLocation, FileRangeReader, GcsAuth, GcsLocation,
    GcsRangeReader, HttpAuth, HttpRangeReader, S3Auth, S3Location, S3RangeReader,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT,
};
use crate::config::{params, ParamKind, ParamSpec, ReaderConfig};
use crate::error::ReadError;
use crate::reader::RangeReader;

fn scheme_of(uri: &str) -> Option<String> {
    Url::parse(uri).ok().map(|u| u.scheme().to_string())
}

fn host_of(uri: &str) -> Option<String> {
    Url::parse(uri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

fn is_http_like(uri: &str) -> bool {
    matches!(scheme_of(uri).as_deref(), Some("http") | Some("https"))
}

// =============================================================================
// file
// =============================================================================

/// Serves `file://` URIs and bare filesystem paths.
pub struct FileProvider;

#[async_trait]
impl Provider for FileProvider {
    fn id(&self) -> &'static str {
        "file"
    }

    fn order(&self) -> i32 {
        10
    }

    fn params(&self) -> Vec<ParamSpec> {
        generic_caching_params()
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        let uri = config.uri();
        uri.starts_with("file://") || !uri.contains("://")
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError> {
        let uri = config.uri();
        let path = if uri.starts_with("file://") {
            let url = Url::parse(uri)
                .map_err(|e| ReadError::InvalidArgument(format!("{}: {}", uri, e)))?;
            url.to_file_path().map_err(|_| {
                ReadError::InvalidArgument(format!("{}: not a local file path", uri))
            })?
        } else {
            std::path::PathBuf::from(uri)
        };
        Ok(Box::new(FileRangeReader::open(path).await?))
    }
}

// =============================================================================
// http
// =============================================================================

/// Catch-all for plain `http://` and `https://` servers with range support.
pub struct HttpProvider;

fn http_auth_from(config: &ReaderConfig) -> Result<HttpAuth, ReadError> {
    let kind = config.get_str(params::HTTP_AUTH_KIND).unwrap_or("none");
    let need = |key: &str| {
        config
            .get_str(key)
            .map(str::to_string)
            .ok_or_else(|| {
                ReadError::InvalidArgument(format!("{} is required for {} auth", key, kind))
            })
    };
    match kind {
        "none" => {
            if config.headers().is_empty() {
                Ok(HttpAuth::None)
            } else {
                Ok(HttpAuth::Headers(config.headers().to_vec()))
            }
        }
        "basic" => Ok(HttpAuth::Basic {
            username: need(params::HTTP_AUTH_USERNAME)?,
            password: need(params::HTTP_AUTH_PASSWORD)?,
        }),
        "bearer" => Ok(HttpAuth::Bearer {
            token: need(params::HTTP_AUTH_TOKEN)?,
        }),
        "api_key" => Ok(HttpAuth::ApiKey {
            header: config
                .get_str(params::HTTP_AUTH_HEADER_NAME)
                .unwrap_or("x-api-key")
                .to_string(),
            value: need(params::HTTP_AUTH_TOKEN)?,
        }),
        "digest" => Ok(HttpAuth::Digest {
            username: need(params::HTTP_AUTH_USERNAME)?,
            password: need(params::HTTP_AUTH_PASSWORD)?,
        }),
        "custom" => {
            let mut headers = config.headers().to_vec();
            if let (Some(name), Some(value)) = (
                config.get_str(params::HTTP_AUTH_HEADER_NAME),
                config.get_str(params::HTTP_AUTH_HEADER_VALUE),
            ) {
                headers.push((name.to_string(), value.to_string()));
            }
            if headers.is_empty() {
                return Err(ReadError::InvalidArgument(
                    "custom auth needs at least one header".to_string(),
                ));
            }
            Ok(HttpAuth::Headers(headers))
        }
        other => Err(ReadError::InvalidArgument(format!(
            "unknown {}: {}",
            params::HTTP_AUTH_KIND,
            other
        ))),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &'static str {
        "http"
    }

    fn order(&self) -> i32 {
        50
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut specs = vec![
            ParamSpec::new(
                params::HTTP_AUTH_KIND,
                ParamKind::Str,
                "auth",
                "One of none, basic, bearer, api_key, digest, custom.",
            ),
            ParamSpec::new(
                params::HTTP_AUTH_USERNAME,
                ParamKind::Str,
                "auth",
                "User name for basic or digest auth.",
            ),
            ParamSpec::new(
                params::HTTP_AUTH_PASSWORD,
                ParamKind::Str,
                "auth",
                "Password for basic or digest auth.",
            ),
            ParamSpec::new(
                params::HTTP_AUTH_TOKEN,
                ParamKind::Str,
                "auth",
                "Bearer token or api_key value.",
            ),
            ParamSpec::new(
                params::HTTP_AUTH_HEADER_NAME,
                ParamKind::Str,
                "auth",
                "Header name for api_key or custom auth.",
            ),
            ParamSpec::new(
                params::HTTP_AUTH_HEADER_VALUE,
                ParamKind::Str,
                "auth",
                "Header value for custom auth.",
            ),
            ParamSpec::new(
                params::HTTP_TIMEOUT_SECONDS,
                ParamKind::U64,
                "connection",
                "Per-request timeout in seconds.",
            ),
        ];
        specs.extend(generic_caching_params());
        specs
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        is_http_like(config.uri())
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError> {
        let mut builder = HttpRangeReader::builder(config.uri())?.auth(http_auth_from(config)?);
        if let Some(secs) = config.get_u64(params::HTTP_TIMEOUT_SECONDS) {
            builder = builder.timeout(std::time::Duration::from_secs(secs));
        }
        Ok(Box::new(builder.connect().await?))
    }
}

// =============================================================================
// s3
// =============================================================================

/// S3 and S3-compatible stores (MinIO, Ceph RGW, ...).
pub struct S3Provider;

fn has_s3_params(config: &ReaderConfig) -> bool {
    [
        params::S3_ENDPOINT,
        params::S3_REGION,
        params::S3_FORCE_PATH_STYLE,
        params::AWS_ACCESS_KEY_ID,
        params::AWS_SECRET_ACCESS_KEY,
        params::AWS_DEFAULT_PROFILE,
        params::AWS_USE_DEFAULT_CREDENTIALS_PROVIDER,
    ]
    .iter()
    .any(|key| config.get(key).is_some())
}

fn s3_auth_from(config: &ReaderConfig) -> S3Auth {
    if let (Some(access_key_id), Some(secret_access_key)) = (
        config.get_str(params::AWS_ACCESS_KEY_ID),
        config.get_str(params::AWS_SECRET_ACCESS_KEY),
    ) {
        return S3Auth::Static {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        };
    }
    if let Some(profile) = config.get_str(params::AWS_DEFAULT_PROFILE) {
        return S3Auth::Profile(profile.to_string());
    }
    // Explicitly opting out of the chain means unsigned requests.
    match config.get_bool(params::AWS_USE_DEFAULT_CREDENTIALS_PROVIDER) {
        Some(false) => S3Auth::Anonymous,
        _ => S3Auth::DefaultChain,
    }
}

#[async_trait]
impl Provider for S3Provider {
    fn id(&self) -> &'static str {
        "s3"
    }

    fn order(&self) -> i32 {
        20
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut specs = vec![
            ParamSpec::new(params::S3_REGION, ParamKind::Str, "connection", "AWS region."),
            ParamSpec::new(
                params::S3_ENDPOINT,
                ParamKind::Str,
                "connection",
                "Custom endpoint URL for S3-compatible services.",
            ),
            ParamSpec::new(
                params::S3_FORCE_PATH_STYLE,
                ParamKind::Bool,
                "connection",
                "Use path-style addressing, required by most S3-compatible services.",
            ),
            ParamSpec::new(
                params::AWS_ACCESS_KEY_ID,
                ParamKind::Str,
                "auth",
                "Static access key id.",
            ),
            ParamSpec::new(
                params::AWS_SECRET_ACCESS_KEY,
                ParamKind::Str,
                "auth",
                "Static secret access key.",
            ),
            ParamSpec::new(
                params::AWS_USE_DEFAULT_CREDENTIALS_PROVIDER,
                ParamKind::Bool,
                "auth",
                "Resolve credentials through the SDK default chain; false means unsigned requests.",
            ),
            ParamSpec::new(
                params::AWS_DEFAULT_PROFILE,
                ParamKind::Str,
                "auth",
                "Named profile from the shared AWS config files.",
            ),
        ];
        specs.extend(generic_caching_params());
        specs
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        let uri = config.uri();
        match scheme_of(uri).as_deref() {
            Some("s3") => S3Location::parse(uri).is_ok(),
            Some("http") | Some("https") => {
                if S3Location::parse(uri).is_err() {
                    return false;
                }
                let amazon = host_of(uri)
                    .map(|h| h.ends_with(".amazonaws.com"))
                    .unwrap_or(false);
                amazon || has_s3_params(config)
            }
            _ => false,
        }
    }

    fn can_process_headers(&self, uri: &Url, headers: &HeaderMap) -> bool {
        headers.keys().any(|k| k.as_str().starts_with("x-amz-"))
            || uri
                .host_str()
                .map(|h| h.ends_with(".amazonaws.com"))
                .unwrap_or(false)
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError> {
        let mut location = S3Location::parse(config.uri())?;
        if let Some(endpoint) = config.get_str(params::S3_ENDPOINT) {
            location.endpoint = Some(endpoint.trim_end_matches('/').to_string());
        }
        let auth = s3_auth_from(config);
        let force_path_style = config.bool_or(params::S3_FORCE_PATH_STYLE, false);
        let client = crate::backend::build_s3_client(
            &location,
            &auth,
            config.get_str(params::S3_REGION),
            force_path_style,
        )
        .await;
        Ok(Box::new(
            S3RangeReader::connect(client, location.bucket, location.key).await?,
        ))
    }
}

// =============================================================================
// gcs
// =============================================================================

/// Google Cloud Storage.
pub struct GcsProvider;

#[async_trait]
impl Provider for GcsProvider {
    fn id(&self) -> &'static str {
        "gcs"
    }

    fn order(&self) -> i32 {
        30
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut specs = vec![
            ParamSpec::new(
                params::GCS_PROJECT_ID,
                ParamKind::Str,
                "connection",
                "Project owning the bucket.",
            ),
            ParamSpec::new(
                params::GCS_QUOTA_PROJECT_ID,
                ParamKind::Str,
                "connection",
                "Project billed for requester-pays access.",
            ),
            ParamSpec::new(
                params::GCS_USE_DEFAULT_APPLICATION_CREDENTIALS,
                ParamKind::Bool,
                "auth",
                "Fetch tokens from the metadata server (application-default flow).",
            ),
            ParamSpec::new(
                params::GCS_BEARER_TOKEN,
                ParamKind::Str,
                "auth",
                "Caller-supplied OAuth access token.",
            ),
        ];
        specs.extend(generic_caching_params());
        specs
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        let uri = config.uri();
        match scheme_of(uri).as_deref() {
            Some("gs") | Some("http") | Some("https") => GcsLocation::parse(uri).is_ok(),
            _ => false,
        }
    }

    fn can_process_headers(&self, uri: &Url, headers: &HeaderMap) -> bool {
        headers.keys().any(|k| k.as_str().starts_with("x-goog-"))
            || uri.host_str() == Some("storage.googleapis.com")
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError> {
        let location = GcsLocation::parse(config.uri())?;
        let auth = if let Some(token) = config.get_str(params::GCS_BEARER_TOKEN) {
            GcsAuth::BearerToken(token.to_string())
        } else if config.bool_or(params::GCS_USE_DEFAULT_APPLICATION_CREDENTIALS, false) {
            GcsAuth::MetadataServer
        } else {
            GcsAuth::Anonymous
        };
        let quota_project = config
            .get_str(params::GCS_QUOTA_PROJECT_ID)
            .map(str::to_string);
        Ok(Box::new(
            GcsRangeReader::connect_with(
                location,
                auth,
                quota_project,
                DEFAULT_TIMEOUT,
                DEFAULT_RETRY_ATTEMPTS,
            )
            .await?,
        ))
    }
}

// =============================================================================
// azure
// =============================================================================

/// Azure Blob Storage.
pub struct AzureProvider;

fn azure_auth_from(config: &ReaderConfig) -> AzureAuth {
    if let Some(key) = config.get_str(params::AZURE_ACCOUNT_KEY) {
        AzureAuth::AccountKey(key.to_string())
    } else if let Some(sas) = config.get_str(params::AZURE_SAS_TOKEN) {
        AzureAuth::SasToken(sas.to_string())
    } else {
        AzureAuth::Anonymous
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn id(&self) -> &'static str {
        "azure"
    }

    fn order(&self) -> i32 {
        40
    }

    fn params(&self) -> Vec<ParamSpec> {
        let mut specs = vec![
            ParamSpec::new(
                params::AZURE_CONNECTION_STRING,
                ParamKind::Str,
                "auth",
                "Storage connection string; overrides account/key parameters.",
            ),
            ParamSpec::new(
                params::AZURE_ACCOUNT_NAME,
                ParamKind::Str,
                "connection",
                "Storage account name.",
            ),
            ParamSpec::new(
                params::AZURE_ACCOUNT_KEY,
                ParamKind::Str,
                "auth",
                "Shared key (base64) for request signing.",
            ),
            ParamSpec::new(
                params::AZURE_SAS_TOKEN,
                ParamKind::Str,
                "auth",
                "Shared access signature appended to every request.",
            ),
            ParamSpec::new(
                params::AZURE_ENDPOINT,
                ParamKind::Str,
                "connection",
                "Blob endpoint for Azurite or sovereign clouds.",
            ),
            ParamSpec::new(
                params::AZURE_CONTAINER,
                ParamKind::Str,
                "connection",
                "Container, when the URI does not carry it.",
            ),
            ParamSpec::new(
                params::AZURE_BLOB,
                ParamKind::Str,
                "connection",
                "Blob name, when the URI does not carry it.",
            ),
        ];
        specs.extend(generic_caching_params());
        specs
    }

    fn can_process(&self, config: &ReaderConfig) -> bool {
        if config.get(params::AZURE_CONNECTION_STRING).is_some() {
            return true;
        }
        if config.get_str(params::AZURE_ACCOUNT_NAME).is_some()
            && config.get_str(params::AZURE_CONTAINER).is_some()
            && config.get_str(params::AZURE_BLOB).is_some()
        {
            return true;
        }
        is_http_like(config.uri()) && AzureLocation::parse(config.uri()).is_ok()
    }

    fn can_process_headers(&self, _uri: &Url, headers: &HeaderMap) -> bool {
        headers.keys().any(|k| k.as_str().starts_with("x-ms-"))
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError> {
        let container_blob = |uri_ok: Option<&AzureLocation>| {
            let container = config
                .get_str(params::AZURE_CONTAINER)
                .map(str::to_string)
                .or_else(|| uri_ok.map(|l| l.container.clone()));
            let blob = config
                .get_str(params::AZURE_BLOB)
                .map(str::to_string)
                .or_else(|| uri_ok.map(|l| l.blob.clone()));
            (container, blob)
        };

        let from_uri = AzureLocation::parse(config.uri()).ok();

        if let Some(connection_string) = config.get_str(params::AZURE_CONNECTION_STRING) {
            let (container, blob) = container_blob(from_uri.as_ref());
            let (container, blob) = container.zip(blob).ok_or_else(|| {
                ReadError::InvalidArgument(
                    "a connection string needs container and blob parameters".to_string(),
                )
            })?;
            return Ok(Box::new(
                AzureBlobRangeReader::from_connection_string(
                    connection_string,
                    &container,
                    &blob,
                )
                .await?,
            ));
        }

        let auth = azure_auth_from(config);
        let location = match from_uri {
            Some(location) => location,
            None => {
                let account = config
                    .get_str(params::AZURE_ACCOUNT_NAME)
                    .ok_or_else(|| {
                        ReadError::InvalidArgument(format!(
                            "{} is required without a blob URI",
                            params::AZURE_ACCOUNT_NAME
                        ))
                    })?;
                let (container, blob) = container_blob(None);
                let (container, blob) = container.zip(blob).ok_or_else(|| {
                    ReadError::InvalidArgument(
                        "container and blob parameters are required without a blob URI"
                            .to_string(),
                    )
                })?;
                match config.get_str(params::AZURE_ENDPOINT) {
                    Some(endpoint) => {
                        AzureLocation::with_endpoint(endpoint, account, &container, &blob)
                    }
                    None => AzureLocation::from_parts(account, &container, &blob),
                }
            }
        };
        Ok(Box::new(AzureBlobRangeReader::connect(location, auth).await?))
    }
}
