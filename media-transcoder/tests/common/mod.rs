//! Shared test doubles

#![allow(dead_code)]

use async_trait::async_trait;
use media_transcoder::storage::{ObjectBody, ObjectReader, ObjectStore, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// In-memory object store that tracks upload concurrency
#[derive(Default)]
pub struct MemoryStore {
    pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub content_types: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub attempts: AtomicUsize,
    /// Keys that always fail with a permanent error
    pub reject: HashSet<String>,
    /// Number of leading transient failures per key
    pub flaky: Mutex<HashMap<String, usize>>,
    pub delay: Duration,
}

impl MemoryStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody,
    ) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        let transient = {
            let mut flaky = self.flaky.lock().unwrap();
            match flaky.get_mut(key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let result = if self.reject.contains(key) {
            Err(StorageError::Request {
                key: key.to_string(),
                message: "403 Forbidden".to_string(),
                retryable: false,
            })
        } else if transient {
            Err(StorageError::Request {
                key: key.to_string(),
                message: "503 Slow Down".to_string(),
                retryable: true,
            })
        } else {
            let mut data = Vec::new();
            match body.reader.read_to_end(&mut data).await {
                Ok(_) => {
                    self.content_types
                        .lock()
                        .unwrap()
                        .insert(key.to_string(), body.content_type.clone());
                    self.insert(bucket, key, &data);
                    Ok(())
                }
                Err(e) => Err(StorageError::Io(e)),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn download_stream(&self, bucket: &str, key: &str) -> Result<ObjectReader, StorageError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}

/// Write an executable `sh` script standing in for an external tool
#[cfg(unix)]
pub fn fake_tool(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
