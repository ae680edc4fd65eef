//! Provider registry and URI dispatch.
//!
//! Each backend registers a [`Provider`]: a factory that recognizes the
//! URIs it can serve and constructs a reader from a [`ReaderConfig`].
//! Dispatch picks a provider, creates the backend, and wraps it with the
//! caching decorators the generic parameters ask for.

mod builtin;

pub use builtin::{AzureProvider, FileProvider, GcsProvider, HttpProvider, S3Provider};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tracing::debug;
use url::Url;

use crate::cache::{
    DiskCache, MemoryCache, DEFAULT_DISK_BLOCK_SIZE, DEFAULT_DISK_MAX_BYTES,
    DEFAULT_MEMORY_BLOCK_SIZE, DEFAULT_MEMORY_MAX_BYTES, DEFAULT_MEMORY_MAX_ENTRIES,
};
use crate::config::{params, ParamKind, ParamSpec, ParamValue, ReaderConfig};
use crate::error::ReadError;
use crate::reader::RangeReader;

/// A provider named `<id>` is disabled when `RANGE_READER_<ID>=false`.
pub const PROVIDER_ENV_PREFIX: &str = "RANGE_READER_";

/// How long the unauthenticated disambiguation probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory for one backend family.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier: `file`, `http`, `s3`, `azure`, `gcs`.
    fn id(&self) -> &'static str;

    /// Lower sorts first when several providers accept a URI.
    fn order(&self) -> i32 {
        100
    }

    /// Providers can be switched off by environment variable without code
    /// changes, e.g. `RANGE_READER_S3=false`.
    fn is_enabled(&self) -> bool {
        let var = format!("{}{}", PROVIDER_ENV_PREFIX, self.id().to_ascii_uppercase());
        match std::env::var(var) {
            Ok(value) => !value.eq_ignore_ascii_case("false"),
            Err(_) => true,
        }
    }

    /// The typed parameters this provider understands.
    fn params(&self) -> Vec<ParamSpec>;

    /// URI-shape test: can this provider serve `config` at all?
    fn can_process(&self, config: &ReaderConfig) -> bool;

    /// Refine the claim using response headers from an unauthenticated
    /// probe `HEAD` (object stores advertise themselves: S3 sends
    /// `x-amz-*`, GCS `x-goog-*`, Azure `x-ms-*`).
    fn can_process_headers(&self, uri: &Url, headers: &HeaderMap) -> bool {
        let _ = (uri, headers);
        true
    }

    async fn create(&self, config: &ReaderConfig) -> Result<Box<dyn RangeReader>, ReadError>;
}

/// The generic caching parameters every provider carries, applied by the
/// dispatch layer after the backend is created.
pub(crate) fn generic_caching_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new(
            params::MEMORY_CACHE_ENABLED,
            ParamKind::Bool,
            "caching",
            "Keep recently read data in a bounded in-memory cache.",
        )
        .with_default(ParamValue::Bool(false)),
        ParamSpec::new(
            params::MEMORY_CACHE_BLOCK_ALIGNED,
            ParamKind::Bool,
            "caching",
            "Key the memory cache by fixed-size blocks instead of raw ranges.",
        )
        .with_default(ParamValue::Bool(false)),
        ParamSpec::new(
            params::MEMORY_CACHE_BLOCK_SIZE,
            ParamKind::U32,
            "caching",
            "Block size for the block-aligned memory cache.",
        )
        .with_default(ParamValue::U32(DEFAULT_MEMORY_BLOCK_SIZE as u32)),
        ParamSpec::new(
            params::MEMORY_CACHE_MAX_BYTES,
            ParamKind::U64,
            "caching",
            "Total byte bound for the memory cache.",
        )
        .with_default(ParamValue::U64(DEFAULT_MEMORY_MAX_BYTES)),
        ParamSpec::new(
            params::DISK_CACHE_ENABLED,
            ParamKind::Bool,
            "caching",
            "Spill blocks to a bounded on-disk cache.",
        )
        .with_default(ParamValue::Bool(false)),
        ParamSpec::new(
            params::DISK_CACHE_DIR,
            ParamKind::Str,
            "caching",
            "Directory holding the on-disk cache.",
        ),
        ParamSpec::new(
            params::DISK_CACHE_MAX_BYTES,
            ParamKind::U64,
            "caching",
            "Total on-disk byte bound.",
        )
        .with_default(ParamValue::U64(DEFAULT_DISK_MAX_BYTES)),
        ParamSpec::new(
            params::DISK_CACHE_BLOCK_SIZE,
            ParamKind::U32,
            "caching",
            "Block size for on-disk cache files.",
        )
        .with_default(ParamValue::U32(DEFAULT_DISK_BLOCK_SIZE as u32)),
    ]
}

// =============================================================================
// Registry
// =============================================================================

/// Holds the known providers and dispatches URIs to them.
///
/// Registries are plain values: construct one with the builtins via
/// [`ProviderRegistry::with_defaults`], add custom providers with
/// [`register`](ProviderRegistry::register). Tests build their own
/// registries, so there is no process-global state to reset.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// A registry with the five builtin providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(FileProvider));
        registry.register(Arc::new(S3Provider));
        registry.register(Arc::new(GcsProvider));
        registry.register(Arc::new(AzureProvider));
        registry.register(Arc::new(HttpProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// Open `uri` with default parameters.
    pub async fn open(&self, uri: &str) -> Result<Box<dyn RangeReader>, ReadError> {
        self.open_with(&ReaderConfig::new(uri)).await
    }

    /// Select a provider for `config`, create the backend, and apply the
    /// caching decorators its parameters request.
    pub async fn open_with(
        &self,
        config: &ReaderConfig,
    ) -> Result<Box<dyn RangeReader>, ReadError> {
        let provider = self.select(config).await?;
        debug!(provider = provider.id(), uri = config.uri(), "dispatching");
        let reader = provider.create(config).await?;
        decorate(reader, config).await
    }

    async fn select(&self, config: &ReaderConfig) -> Result<Arc<dyn Provider>, ReadError> {
        if let Some(id) = config.provider_id() {
            let provider = self
                .providers
                .iter()
                .find(|p| p.id() == id)
                .ok_or_else(|| {
                    ReadError::Unavailable(format!("no provider with id {}", id))
                })?;
            if !provider.is_enabled() {
                return Err(ReadError::Unavailable(format!(
                    "provider {} is disabled",
                    id
                )));
            }
            return Ok(Arc::clone(provider));
        }

        let mut candidates: Vec<_> = self
            .providers
            .iter()
            .filter(|p| p.is_enabled() && p.can_process(config))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| p.order());

        match candidates.len() {
            0 => Err(ReadError::Unavailable(format!(
                "no provider accepts {}",
                config.uri()
            ))),
            1 => Ok(candidates.swap_remove(0)),
            _ => {
                if let Some((url, headers)) = probe(config.uri()).await {
                    if let Some(provider) = candidates
                        .iter()
                        .find(|p| p.can_process_headers(&url, &headers))
                    {
                        debug!(
                            provider = provider.id(),
                            uri = config.uri(),
                            "probe disambiguated"
                        );
                        return Ok(Arc::clone(provider));
                    }
                }
                // No probe possible or nothing decisive: highest priority wins.
                Ok(candidates.swap_remove(0))
            }
        }
    }
}

/// Unauthenticated `HEAD` against an http(s) URI, for header-based
/// disambiguation. Any failure simply yields no verdict.
async fn probe(uri: &str) -> Option<(Url, HeaderMap)> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .ok()?;
    let resp = client.head(url.clone()).send().await.ok()?;
    Some((url, resp.headers().clone()))
}

/// Wrap `reader` per the generic caching parameters: the disk cache sits
/// closest to the backend, the memory cache outermost.
async fn decorate(
    reader: Box<dyn RangeReader>,
    config: &ReaderConfig,
) -> Result<Box<dyn RangeReader>, ReadError> {
    let mut reader = reader;

    if config.bool_or(params::DISK_CACHE_ENABLED, false) {
        let dir = config.get_str(params::DISK_CACHE_DIR).ok_or_else(|| {
            ReadError::InvalidArgument(format!(
                "{} is required when the disk cache is enabled",
                params::DISK_CACHE_DIR
            ))
        })?;
        let max_bytes = config
            .get_u64(params::DISK_CACHE_MAX_BYTES)
            .unwrap_or(DEFAULT_DISK_MAX_BYTES);
        let block_size = config
            .get_u32(params::DISK_CACHE_BLOCK_SIZE)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_DISK_BLOCK_SIZE);
        reader = Box::new(DiskCache::open_with(reader, dir, max_bytes, block_size).await?);
    }

    if config.bool_or(params::MEMORY_CACHE_ENABLED, false) {
        let max_bytes = config
            .get_u64(params::MEMORY_CACHE_MAX_BYTES)
            .unwrap_or(DEFAULT_MEMORY_MAX_BYTES);
        reader = if config.bool_or(params::MEMORY_CACHE_BLOCK_ALIGNED, false) {
            let block_size = config
                .get_u32(params::MEMORY_CACHE_BLOCK_SIZE)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MEMORY_BLOCK_SIZE);
            Box::new(MemoryCache::block_aligned_with(
                reader,
                block_size,
                max_bytes,
                DEFAULT_MEMORY_MAX_ENTRIES,
            ))
        } else {
            Box::new(MemoryCache::with_capacity(
                reader,
                max_bytes,
                DEFAULT_MEMORY_MAX_ENTRIES,
            ))
        };
    }

    Ok(reader)
}
