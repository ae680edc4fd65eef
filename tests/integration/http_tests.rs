//! HTTP backend against a live local server.

use range_reader::{
    open_with, params, HttpAuth, HttpRangeReader, RangeReader, ReadError, ReaderConfig,
};

use super::test_utils::{serve, serve_basic_auth, serve_ignoring_ranges, test_content};

const FIXTURE_LEN: usize = 512 * 1024;

#[tokio::test]
async fn test_ranged_get_matches_local_content() {
    let data = test_content(FIXTURE_LEN);
    let server = serve(data.clone()).await;

    let reader = HttpRangeReader::open(&server.url()).await.unwrap();
    assert_eq!(reader.size(), Some(FIXTURE_LEN as u64));

    let bytes = reader.read_at(50_000, 8192).await.unwrap();
    assert_eq!(&bytes[..], &data[50_000..58_192]);

    let tail = reader.read_at(FIXTURE_LEN as u64 - 10, 100).await.unwrap();
    assert_eq!(&tail[..], &data[FIXTURE_LEN - 10..]);

    assert!(reader
        .read_at(FIXTURE_LEN as u64 + 1, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_basic_auth_required() {
    let data = test_content(8192);
    let server = serve_basic_auth(data.clone(), "alice", "secret").await;

    // No credentials: construction fails on the size probe.
    let err = HttpRangeReader::open(&server.url()).await.unwrap_err();
    assert!(matches!(err, ReadError::AuthDenied(_)));

    // Wrong password: same.
    let err = HttpRangeReader::builder(&server.url())
        .unwrap()
        .auth(HttpAuth::Basic {
            username: "alice".into(),
            password: "wrong".into(),
        })
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, ReadError::AuthDenied(_)));

    // Correct credentials: reads flow.
    let reader = HttpRangeReader::builder(&server.url())
        .unwrap()
        .auth(HttpAuth::Basic {
            username: "alice".into(),
            password: "secret".into(),
        })
        .connect()
        .await
        .unwrap();
    let bytes = reader.read_at(1000, 500).await.unwrap();
    assert_eq!(&bytes[..], &data[1000..1500]);
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let server = serve(test_content(128)).await;
    let url = format!("http://{}/absent.bin", server.addr);
    let err = HttpRangeReader::open(&url).await.unwrap_err();
    assert!(matches!(err, ReadError::NotFound(_)));
}

#[tokio::test]
async fn test_server_ignoring_range_small_body_is_sliced() {
    let data = test_content(4096);
    let server = serve_ignoring_ranges(data.clone()).await;

    let reader = HttpRangeReader::open(&server.url()).await.unwrap();
    // 4096-byte body for a 1000-byte request is within tolerance: the
    // client slices out the requested window locally.
    let bytes = reader.read_at(500, 1000).await.unwrap();
    assert_eq!(&bytes[..], &data[500..1500]);
}

#[tokio::test]
async fn test_server_ignoring_range_huge_body_is_refused() {
    let data = test_content(FIXTURE_LEN);
    let server = serve_ignoring_ranges(data).await;

    let reader = HttpRangeReader::open(&server.url()).await.unwrap();
    // Half a megabyte for a 100-byte request: refuse to buffer it.
    let err = reader.read_at(0, 100).await.unwrap_err();
    assert!(matches!(err, ReadError::Network(_) | ReadError::Protocol(_)));
}

#[tokio::test]
async fn test_cached_http_pipeline_limits_server_traffic() {
    let data = test_content(256 * 1024);
    let server = serve(data.clone()).await;

    let config = ReaderConfig::new(&server.url())
        .set(params::MEMORY_CACHE_ENABLED, true)
        .set(params::MEMORY_CACHE_BLOCK_ALIGNED, true)
        .set(params::MEMORY_CACHE_BLOCK_SIZE, 65536u32);
    let reader = open_with(&config).await.unwrap();

    let before = server.requests();
    let bytes = reader.read_at(100, 500).await.unwrap();
    assert_eq!(&bytes[..], &data[100..600]);
    assert_eq!(server.requests(), before + 1);

    // Every further read inside the cached block is free.
    for offset in [0u64, 200, 40_000, 65_000] {
        reader.read_at(offset, 400).await.unwrap();
    }
    assert_eq!(server.requests(), before + 1);
}
