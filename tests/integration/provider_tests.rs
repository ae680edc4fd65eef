//! Provider dispatch through the public front door.

use std::io::Write;

use range_reader::{
    open, open_with, params, Provider, ProviderRegistry, ReadError, ReaderConfig, S3Provider,
};

use super::test_utils::{serve, test_content};

fn fixture_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_unknown_scheme_is_unavailable() {
    let err = open("carrier-pigeon://coop/message").await.unwrap_err();
    assert!(matches!(err, ReadError::Unavailable(_)));
}

#[tokio::test]
async fn test_http_uri_dispatches_to_http_provider() {
    let data = test_content(16 * 1024);
    let server = serve(data.clone()).await;

    let reader = open(&server.url()).await.unwrap();
    let bytes = reader.read_at(5000, 1000).await.unwrap();
    assert_eq!(&bytes[..], &data[5000..6000]);
}

#[tokio::test]
async fn test_pinned_provider_rejects_when_disabled() {
    // The kill switch is consulted before any client is constructed.
    std::env::set_var("RANGE_READER_S3", "false");
    let config = ReaderConfig::new("s3://bucket/key").with_provider("s3");
    let result = open_with(&config).await;
    std::env::remove_var("RANGE_READER_S3");

    assert!(matches!(result, Err(ReadError::Unavailable(_))));
}

#[tokio::test]
async fn test_registry_lists_builtin_providers() {
    let registry = ProviderRegistry::with_defaults();
    let mut ids: Vec<_> = registry.providers().iter().map(|p| p.id()).collect();
    ids.sort();
    assert_eq!(ids, vec!["azure", "file", "gcs", "http", "s3"]);
}

#[tokio::test]
async fn test_s3_provider_declares_its_parameters() {
    let specs = S3Provider.params();
    for key in [
        params::S3_REGION,
        params::S3_FORCE_PATH_STYLE,
        params::S3_ENDPOINT,
        params::AWS_ACCESS_KEY_ID,
        params::MEMORY_CACHE_ENABLED,
        params::DISK_CACHE_DIR,
    ] {
        assert!(specs.iter().any(|s| s.key == key), "missing {}", key);
    }
}

#[tokio::test]
async fn test_config_builds_fully_decorated_pipeline() {
    let data = test_content(512 * 1024);
    let file = fixture_file(&data);
    let cache_dir = tempfile::tempdir().unwrap();

    let config = ReaderConfig::new(file.path().to_str().unwrap())
        .set(params::DISK_CACHE_ENABLED, true)
        .set(params::DISK_CACHE_DIR, cache_dir.path().to_str().unwrap())
        .set(params::DISK_CACHE_BLOCK_SIZE, 65536u32)
        .set(params::MEMORY_CACHE_ENABLED, true)
        .set(params::MEMORY_CACHE_BLOCK_ALIGNED, true)
        .set(params::MEMORY_CACHE_BLOCK_SIZE, 65536u32);
    let reader = open_with(&config).await.unwrap();

    let bytes = reader.read_at(70_000, 10_000).await.unwrap();
    assert_eq!(&bytes[..], &data[70_000..80_000]);

    // The read went through the disk layer: block files exist, fanned two
    // levels deep under the cache directory.
    let mut block_files = Vec::new();
    for level1 in std::fs::read_dir(cache_dir.path()).unwrap() {
        for level2 in std::fs::read_dir(level1.unwrap().path()).unwrap() {
            for file in std::fs::read_dir(level2.unwrap().path()).unwrap() {
                block_files.push(file.unwrap().path());
            }
        }
    }
    assert!(!block_files.is_empty());
    assert!(block_files
        .iter()
        .all(|p| p.extension().and_then(|e| e.to_str()) == Some("blk")));

    // Reads still resolve correctly through both cache layers.
    let again = reader.read_at(70_000, 10_000).await.unwrap();
    assert_eq!(bytes, again);
}

#[tokio::test]
async fn test_explicit_provider_id_overrides_uri_shape() {
    // An http URL pinned to the file provider: selection honors the pin
    // and the file provider then fails to open it as a path.
    let config = ReaderConfig::new("http://host/p").with_provider("file");
    let err = open_with(&config).await.unwrap_err();
    assert!(matches!(err, ReadError::NotFound(_) | ReadError::InvalidArgument(_)));
}
