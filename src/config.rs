//! Backend configuration and the typed parameters providers declare.

use std::collections::HashMap;

// =============================================================================
// Parameter ids
// =============================================================================

/// Well-known parameter keys, grouped the way providers declare them.
pub mod params {
    // Generic caching, honored by the dispatch layer for every provider.
    pub const MEMORY_CACHE_ENABLED: &str = "memory.cache.enabled";
    pub const MEMORY_CACHE_BLOCK_ALIGNED: &str = "memory.cache.block_aligned";
    pub const MEMORY_CACHE_BLOCK_SIZE: &str = "memory.cache.block_size";
    pub const MEMORY_CACHE_MAX_BYTES: &str = "memory.cache.max_bytes";
    pub const DISK_CACHE_ENABLED: &str = "disk.cache.enabled";
    pub const DISK_CACHE_DIR: &str = "disk.cache.dir";
    pub const DISK_CACHE_MAX_BYTES: &str = "disk.cache.max_bytes";
    pub const DISK_CACHE_BLOCK_SIZE: &str = "disk.cache.block_size";

    // HTTP authentication.
    pub const HTTP_AUTH_KIND: &str = "http.auth.kind";
    pub const HTTP_AUTH_USERNAME: &str = "http.auth.username";
    pub const HTTP_AUTH_PASSWORD: &str = "http.auth.password";
    pub const HTTP_AUTH_TOKEN: &str = "http.auth.token";
    pub const HTTP_AUTH_HEADER_NAME: &str = "http.auth.header_name";
    pub const HTTP_AUTH_HEADER_VALUE: &str = "http.auth.header_value";
    pub const HTTP_TIMEOUT_SECONDS: &str = "http.timeout_seconds";

    // S3 and compatible stores.
    pub const S3_REGION: &str = "s3.region";
    pub const S3_FORCE_PATH_STYLE: &str = "s3.force_path_style";
    pub const S3_ENDPOINT: &str = "s3.endpoint";
    pub const AWS_ACCESS_KEY_ID: &str = "aws.access_key_id";
    pub const AWS_SECRET_ACCESS_KEY: &str = "aws.secret_access_key";
    pub const AWS_USE_DEFAULT_CREDENTIALS_PROVIDER: &str =
        "aws.use_default_credentials_provider";
    pub const AWS_DEFAULT_PROFILE: &str = "aws.default_profile";

    // Azure Blob.
    pub const AZURE_CONNECTION_STRING: &str = "azure.connection_string";
    pub const AZURE_ACCOUNT_NAME: &str = "azure.account_name";
    pub const AZURE_ACCOUNT_KEY: &str = "azure.account_key";
    pub const AZURE_SAS_TOKEN: &str = "azure.sas_token";
    pub const AZURE_ENDPOINT: &str = "azure.endpoint";
    pub const AZURE_CONTAINER: &str = "azure.container";
    pub const AZURE_BLOB: &str = "azure.blob";

    // Google Cloud Storage.
    pub const GCS_PROJECT_ID: &str = "gcs.project_id";
    pub const GCS_QUOTA_PROJECT_ID: &str = "gcs.quota_project_id";
    pub const GCS_USE_DEFAULT_APPLICATION_CREDENTIALS: &str =
        "gcs.use_default_application_credentials";
    pub const GCS_BEARER_TOKEN: &str = "gcs.bearer_token";
}

// =============================================================================
// Typed values
// =============================================================================

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Str(String),
}

impl ParamValue {
    /// Boolean view; string values `"true"`/`"false"` coerce, since
    /// configuration frequently arrives as string maps.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ParamValue::U32(n) => Some(*n),
            ParamValue::U64(n) => (*n).try_into().ok(),
            ParamValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::U32(n) => Some(u64::from(*n)),
            ParamValue::U64(n) => Some(*n),
            ParamValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::U32(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::U64(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// The declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    U32,
    U64,
    Str,
}

/// A parameter a provider understands, for discovery and documentation.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    /// Top-level grouping, e.g. `"caching"`, `"auth"`.
    pub group: &'static str,
    pub subgroup: Option<&'static str>,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn new(
        key: &'static str,
        kind: ParamKind,
        group: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            key,
            kind,
            default: None,
            group,
            subgroup: None,
            description,
        }
    }

    pub fn with_default(mut self, default: ParamValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn in_subgroup(mut self, subgroup: &'static str) -> Self {
        self.subgroup = Some(subgroup);
        self
    }
}

// =============================================================================
// Reader configuration
// =============================================================================

/// What to open and how: a URI, an optional explicit provider, typed
/// parameters, and request headers for HTTP-flavored backends.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    uri: String,
    provider_id: Option<String>,
    params: HashMap<String, ParamValue>,
    headers: Vec<(String, String)>,
}

impl ReaderConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            provider_id: None,
            params: HashMap::new(),
            headers: Vec::new(),
        }
    }

    /// Pin dispatch to a specific provider id, bypassing URI matching.
    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(ParamValue::as_bool)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.params.get(key).and_then(ParamValue::as_u32)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(ParamValue::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_str)
    }
}
