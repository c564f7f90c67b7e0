//! Bounded-concurrency upload of an output tree
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
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::{ObjectBody, ObjectStore, StorageError};

/// In-flight uploads per `upload_tree` call
pub const MAX_CONCURRENT_UPLOADS: usize = 12;

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub path: PathBuf,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct UploadFailure {
    pub key: String,
    pub error: StorageError,
}

fn describe(failures: &[UploadFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.key, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to enumerate {path}: {message}")]
    Walk { path: PathBuf, message: String },

    #[error("{} of {} uploads failed: {}", .failures.len(), .failures.len() + .succeeded, describe(.failures))]
    Failed {
        failures: Vec<UploadFailure>,
        succeeded: usize,
    },
}

/// Object key for a file at `relative` under the tree root
pub fn object_key(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// Every regular file under `local_dir`, in a stable order
pub fn enumerate_tasks(
    local_dir: &Path,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<UploadTask>, UploadError> {
    let mut tasks = Vec::new();
    for entry in WalkDir::new(local_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| UploadError::Walk {
            path: local_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local_dir)
            .map_err(|e| UploadError::Walk {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?;
        tasks.push(UploadTask {
            path: entry.path().to_path_buf(),
            bucket: bucket.to_string(),
            key: object_key(prefix, relative),
        });
    }
    Ok(tasks)
}

/// Uploads whole directory trees
#[derive(Clone)]
pub struct UploadManager {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    retry: RetryConfig,
}

impl UploadManager {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Upload every file under `local_dir` to `<destination_prefix>/<relative path>`.
    ///
    /// All uploads run to completion; every failure is returned together.
    pub async fn upload_tree(
        &self,
        local_dir: &Path,
        destination_prefix: &str,
    ) -> Result<UploadSummary, UploadError> {
        let root = local_dir.to_path_buf();
        let bucket = self.bucket.clone();
        let prefix = destination_prefix.to_string();
        let tasks = tokio::task::spawn_blocking(move || enumerate_tasks(&root, &bucket, &prefix))
            .await
            .map_err(|e| UploadError::Walk {
                path: local_dir.to_path_buf(),
                message: e.to_string(),
            })??;

        info!(
            files = tasks.len(),
            bucket = %self.bucket,
            prefix = destination_prefix,
            "Uploading output tree"
        );

        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS));
        let mut in_flight = JoinSet::new();

        for task in tasks {
            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            let permits = Arc::clone(&permits);

            in_flight.spawn(async move {
                // held until this upload finishes
                let _permit = permits.acquire_owned().await;
                let result = upload_one(store.as_ref(), &task, &retry).await;
                (task.key, result)
            });
        }

        let mut summary = UploadSummary::default();
        let mut failures = Vec::new();
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((_, Ok(bytes))) => {
                    summary.files += 1;
                    summary.bytes += bytes;
                }
                Ok((key, Err(error))) => {
                    error!(key = %key, error = %error, "Upload failed");
                    failures.push(UploadFailure { key, error });
                }
                Err(join_error) => {
                    error!(error = %join_error, "Upload task aborted");
                    failures.push(UploadFailure {
                        key: "<unknown>".to_string(),
                        error: StorageError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_error.to_string(),
                        )),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(files = summary.files, bytes = summary.bytes, "Upload complete");
            Ok(summary)
        } else {
            Err(UploadError::Failed {
                failures,
                succeeded: summary.files,
            })
        }
    }
}

async fn upload_one(
    store: &dyn ObjectStore,
    task: &UploadTask,
    retry: &RetryConfig,
) -> Result<u64, StorageError> {
    retry_with_backoff(retry, StorageError::is_retryable, || async move {
        // reopened on every attempt, the previous stream is consumed
        let body = ObjectBody::from_file(&task.path).await?;
        let bytes = body.content_length;
        store.upload_stream(&task.bucket, &task.key, body).await?;
        Ok(bytes)
    })
    .await
}
