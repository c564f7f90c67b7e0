//! Source Fetcher - resolves a job source to a local file
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::storage::{ObjectStore, StorageError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid S3 URL: {0}")]
    InvalidUrl(String),

    #[error("S3 client not configured. Cannot download {0}")]
    StoreNotConfigured(String),

    #[error("Source file not found: {0}")]
    NotFound(PathBuf),

    #[error("Download cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Split `s3://bucket/key` into bucket and key
pub fn parse_s3_url(url: &str) -> Result<(String, String), FetchError> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

/// Resolves job sources: local paths pass through, `s3://` objects are streamed to disk
pub struct SourceFetcher {
    store: Option<Arc<dyn ObjectStore>>,
}

impl SourceFetcher {
    pub fn new(store: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { store }
    }

    pub async fn fetch(
        &self,
        source: &str,
        destination_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        if source.starts_with("s3://") {
            return self.fetch_object(source, destination_dir, cancel).await;
        }

        if let Some((scheme, _)) = source.split_once("://") {
            if scheme != "file" {
                return Err(FetchError::UnsupportedScheme(source.to_string()));
            }
        }

        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        if !tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            return Err(FetchError::NotFound(path));
        }
        info!(source = %path.display(), "Using local source");
        Ok(path)
    }

    async fn fetch_object(
        &self,
        url: &str,
        destination_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| FetchError::StoreNotConfigured(url.to_string()))?;
        let (bucket, key) = parse_s3_url(url)?;

        let file_name = key
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "..")
            .unwrap_or("source");
        let destination = destination_dir.join(file_name);

        info!(
            bucket = %bucket,
            key = %key,
            destination = %destination.display(),
            "Downloading source"
        );

        let mut reader = store.download_stream(&bucket, &key).await?;
        let mut file = tokio::fs::File::create(&destination).await?;

        let copied = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            copied = tokio::io::copy(&mut reader, &mut file) => copied?,
        };
        file.flush().await?;

        info!(bytes = copied, "Source downloaded");
        Ok(destination)
    }
}
