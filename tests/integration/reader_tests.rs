//! End-to-end reads against local files, through the provider front door
//! and directly.

use std::io::Write;
use std::sync::Arc;

use range_reader::{open, FileRangeReader, RangeReader, ReadError, ReaderChannel};

use super::test_utils::test_content;

const FIXTURE_LEN: usize = 2 * 1024 * 1024;

fn fixture_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_file_full_and_tail_reads() {
    let data = test_content(FIXTURE_LEN);
    let file = fixture_file(&data);
    let reader = FileRangeReader::open(file.path()).await.unwrap();

    assert_eq!(reader.size(), Some(FIXTURE_LEN as u64));

    let head = reader.read_at(0, 1024).await.unwrap();
    assert_eq!(&head[..], &data[..1024]);

    let middle = reader.read_at(1_000_000, 4096).await.unwrap();
    assert_eq!(&middle[..], &data[1_000_000..1_004_096]);

    // Ten bytes short of the end, asking for a hundred: ten come back.
    let tail_offset = FIXTURE_LEN as u64 - 10;
    let tail = reader.read_at(tail_offset, 100).await.unwrap();
    assert_eq!(tail.len(), 10);
    assert_eq!(&tail[..], &data[FIXTURE_LEN - 10..]);

    // At and past the end: zero bytes, no error.
    assert!(reader.read_at(FIXTURE_LEN as u64, 100).await.unwrap().is_empty());
    assert!(reader
        .read_at(FIXTURE_LEN as u64 + 5000, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_open_dispatches_bare_paths_and_file_uris() {
    let data = test_content(8192);
    let file = fixture_file(&data);

    let by_path = open(file.path().to_str().unwrap()).await.unwrap();
    assert_eq!(&by_path.read_at(100, 200).await.unwrap()[..], &data[100..300]);

    let uri = format!("file://{}", file.path().display());
    let by_uri = open(&uri).await.unwrap();
    assert_eq!(&by_uri.read_at(100, 200).await.unwrap()[..], &data[100..300]);
    assert!(by_uri.source_id().starts_with("file://"));
}

#[tokio::test]
async fn test_open_missing_file_is_not_found() {
    let err = open("file:///no/such/file.bin").await.unwrap_err();
    assert!(matches!(err, ReadError::NotFound(_)));
}

#[tokio::test]
async fn test_repeated_reads_are_identical() {
    let data = test_content(64 * 1024);
    let file = fixture_file(&data);
    let reader = FileRangeReader::open(file.path()).await.unwrap();

    let first = reader.read_at(10_000, 30_000).await.unwrap();
    let second = reader.read_at(10_000, 30_000).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_channel_streams_whole_file() {
    let data = test_content(100_000);
    let file = fixture_file(&data);
    let reader: Arc<dyn RangeReader> =
        Arc::new(FileRangeReader::open(file.path()).await.unwrap());

    let mut channel = ReaderChannel::new(Arc::clone(&reader));
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = channel.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, data);

    channel.close();
    assert!(matches!(channel.read(&mut buf).await, Err(ReadError::Closed)));

    // The shared reader is still usable after the channel closed.
    assert_eq!(&reader.read_at(0, 16).await.unwrap()[..], &data[..16]);
}
