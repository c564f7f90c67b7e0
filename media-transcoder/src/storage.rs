//! Object Storage - S3-compatible streaming uploads and downloads
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


use async_trait::async_trait;
use rusoto_core::{request::HttpClient, ByteStream, Region, RusotoError};
use rusoto_credential::StaticProvider;
use rusoto_s3::{GetObjectRequest, PutObjectRequest, S3Client, S3};
use std::path::Path;
use std::pin::Pin;
use streamforge_config::ObjectStorageConfig;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Readable object body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create storage client: {0}")]
    Client(String),

    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("storage request for {key} failed: {message}")]
    Request {
        key: String,
        message: String,
        retryable: bool,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Request { retryable, .. } => *retryable,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            StorageError::Client(_) | StorageError::NotFound { .. } => false,
        }
    }
}

/// Streaming upload body
pub struct ObjectBody {
    pub reader: Pin<Box<dyn AsyncRead + Send + Sync>>,
    pub content_length: u64,
    pub content_type: String,
}

impl ObjectBody {
    /// Open a local file as an upload body
    pub async fn from_file(path: &Path) -> Result<Self, StorageError> {
        let file = tokio::fs::File::open(path).await?;
        let content_length = file.metadata().await?.len();
        Ok(Self {
            reader: Box::pin(file),
            content_length,
            content_type: content_type_for(path).to_string(),
        })
    }
}

/// Object-storage collaborator
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
    ) -> Result<(), StorageError>;

    async fn download_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError>;
}

/// MIME type by file extension
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") | Some("m4s") => "video/mp4",
        Some("vtt") => "text/vtt",
        Some("ass") => "text/x-ssa",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn classify<E: std::error::Error + 'static>(key: &str, error: RusotoError<E>) -> StorageError {
    let retryable = match &error {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || response.status.as_u16() == 429
        }
        RusotoError::Blocking => true,
        RusotoError::Service(_)
        | RusotoError::Credentials(_)
        | RusotoError::Validation(_)
        | RusotoError::ParseError(_) => false,
    };
    StorageError::Request {
        key: key.to_string(),
        message: error.to_string(),
        retryable,
    }
}

/// S3-compatible object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStorageConfig) -> Result<Self, StorageError> {
        let credentials =
            StaticProvider::new_minimal(config.access_key.clone(), config.secret_key.clone());

        let region = Region::Custom {
            name: config
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: normalize_endpoint(&config.endpoint),
        };

        info!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            "Creating S3 client"
        );

        let http_client = HttpClient::new().map_err(|e| StorageError::Client(e.to_string()))?;

        Ok(Self {
            client: S3Client::new_with(http_client, credentials, region),
        })
    }
}

/// Endpoints without a scheme are assumed to be HTTPS
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
    ) -> Result<(), StorageError> {
        debug!(
            bucket = bucket,
            key = key,
            bytes = body.content_length,
            "Uploading object"
        );

        let length = usize::try_from(body.content_length)
            .map_err(|_| StorageError::Client(format!("object too large: {}", key)))?;
        let stream = ByteStream::new_with_size(ReaderStream::new(body.reader), length);

        let request = PutObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body: Some(stream),
            content_length: Some(body.content_length as i64),
            content_type: Some(body.content_type),
            cache_control: Some("public, max-age=31536000".to_string()),
            ..Default::default()
        };

        self.client
            .put_object(request)
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn download_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError> {
        let request = GetObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        };

        let output = self.client.get_object(request).await.map_err(|e| match e {
            RusotoError::Service(rusoto_s3::GetObjectError::NoSuchKey(_)) => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => classify(key, other),
        })?;

        let body = output.body.ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        Ok(Box::pin(body.into_async_read()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("out/master.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for(Path::new("video_0/seg_1.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("audio_0.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("storyboard.vtt")), "text/vtt");
        assert_eq!(content_type_for(Path::new("storyboard.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("README")), "application/octet-stream");
    }

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(normalize_endpoint("s3.example.com/"), "https://s3.example.com");
        assert_eq!(normalize_endpoint("http://localhost:9000"), "http://localhost:9000");
    }

    #[test]
    fn test_retryable_classification() {
        let transient = StorageError::Request {
            key: "a".to_string(),
            message: "503".to_string(),
            retryable: true,
        };
        assert!(transient.is_retryable());
        assert!(!StorageError::NotFound {
            bucket: "b".to_string(),
            key: "k".to_string()
        }
        .is_retryable());
        assert!(StorageError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_retryable());
        assert!(!StorageError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_retryable());
    }

    #[tokio::test]
    async fn test_body_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg_1.ts");
        tokio::fs::write(&path, vec![0u8; 4096]).await.unwrap();

        let body = ObjectBody::from_file(&path).await.unwrap();
        assert_eq!(body.content_length, 4096);
        assert_eq!(body.content_type, "video/mp2t");
    }
}
