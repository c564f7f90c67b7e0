//! Source Fetcher Tests

mod common;

use common::MemoryStore;
use media_transcoder::downloader::{FetchError, SourceFetcher};
use media_transcoder::storage::ObjectStore;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_unsupported_url_scheme() {
    let fetcher = SourceFetcher::new(None);
    let temp_dir = TempDir::new().unwrap();

    let result = fetcher
        .fetch("ftp://example.com/file.mp4", temp_dir.path(), &CancellationToken::new())
        .await;

    let error = result.unwrap_err();
    assert!(matches!(error, FetchError::UnsupportedScheme(_)));
    assert!(error.to_string().contains("Unsupported URL scheme"));
}

#[tokio::test]
async fn test_s3_download_without_config() {
    let fetcher = SourceFetcher::new(None);
    let temp_dir = TempDir::new().unwrap();

    let result = fetcher
        .fetch("s3://bucket/key.mp4", temp_dir.path(), &CancellationToken::new())
        .await;

    let error = result.unwrap_err();
    assert!(error.to_string().contains("S3 client not configured"));
}

#[tokio::test]
async fn test_local_source_passes_through() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("input.mp4");
    std::fs::write(&input, b"not really a video").unwrap();

    let fetcher = SourceFetcher::new(None);
    let cancel = CancellationToken::new();

    let plain = fetcher
        .fetch(input.to_str().unwrap(), temp_dir.path(), &cancel)
        .await
        .unwrap();
    assert_eq!(plain, input);

    let url = format!("file://{}", input.display());
    let from_url = fetcher.fetch(&url, temp_dir.path(), &cancel).await.unwrap();
    assert_eq!(from_url, input);
}

#[tokio::test]
async fn test_missing_local_source() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = SourceFetcher::new(None);

    let result = fetcher
        .fetch("/does/not/exist.mp4", temp_dir.path(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(FetchError::NotFound(_))));
}

#[tokio::test]
async fn test_s3_source_is_streamed_to_workspace() {
    let store = Arc::new(MemoryStore::default());
    store.insert("media", "uploads/2024/clip.mp4", &[7u8; 10_000]);

    let fetcher = SourceFetcher::new(Some(store as Arc<dyn ObjectStore>));
    let temp_dir = TempDir::new().unwrap();

    let path = fetcher
        .fetch("s3://media/uploads/2024/clip.mp4", temp_dir.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(path, temp_dir.path().join("clip.mp4"));
    assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 10_000]);
}

#[tokio::test]
async fn test_s3_missing_object() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());
    let fetcher = SourceFetcher::new(Some(store));
    let temp_dir = TempDir::new().unwrap();

    let result = fetcher
        .fetch("s3://media/missing.mp4", temp_dir.path(), &CancellationToken::new())
        .await;

    let error = result.unwrap_err();
    assert!(error.to_string().contains("object not found: media/missing.mp4"));
}
