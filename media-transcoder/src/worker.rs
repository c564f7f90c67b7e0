//! Transcode Worker - runs one job end to end
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


use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use streamforge_config::{AppConfig, TranscoderSettings};
use streamforge_types::{JobReport, TranscodeJob};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::downloader::SourceFetcher;
use crate::pipeline::{JobWorkspace, PipelineEvent, TranscodePipeline};
use crate::retry::RetryConfig;
use crate::storage::{ObjectStore, S3ObjectStore};
use crate::upload::UploadManager;

/// Fetch, transcode and upload a single job inside its own workspace
pub struct TranscodeWorker {
    settings: TranscoderSettings,
    fetcher: SourceFetcher,
    uploader: Option<UploadManager>,
}

impl TranscodeWorker {
    pub fn new(
        settings: TranscoderSettings,
        fetcher: SourceFetcher,
        uploader: Option<UploadManager>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            uploader,
        }
    }

    /// Wire the worker from configuration; uploads need object storage and `upload`
    pub fn from_config(config: &AppConfig, upload: bool) -> anyhow::Result<Self> {
        let store: Option<Arc<dyn ObjectStore>> = match &config.object_storage {
            Some(storage) => Some(Arc::new(
                S3ObjectStore::new(storage).context("Failed to create object storage client")?,
            )),
            None => {
                warn!("Object storage not configured, remote sources and uploads are disabled");
                None
            }
        };

        let uploader = match (&store, &config.object_storage) {
            (Some(store), Some(storage)) if upload => Some(
                UploadManager::new(Arc::clone(store), storage.bucket.clone())
                    .with_retry(RetryConfig::from_env()),
            ),
            _ => None,
        };

        Ok(Self::new(
            config.transcoder.clone(),
            SourceFetcher::new(store),
            uploader,
        ))
    }

    /// Process `job`. The workspace is removed afterwards unless the output
    /// stays local (no uploader) or the job failed with `keep_failed_output` set.
    pub async fn process(
        &self,
        job: &TranscodeJob,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<JobReport> {
        job.validate().context("Invalid transcode job")?;

        let job_id = job.job_id.to_string();
        info!(
            job_id = %job_id,
            source = %job.source,
            gpu = job.gpu.unwrap_or(self.settings.gpu),
            "Processing transcode job"
        );

        let workspace = JobWorkspace::acquire(&self.settings.work_dir, &job_id)
            .await
            .with_context(|| format!("Failed to prepare workspace for job {}", job_id))?;

        match self.run_job(job, &workspace, events, cancel).await {
            Ok(mut report) => {
                if self.uploader.is_some() {
                    if let Err(e) = workspace.release().await {
                        warn!(job_id = %job_id, error = %e, "Failed to remove workspace");
                    }
                } else {
                    report.output_dir = Some(workspace.output_dir().display().to_string());
                    workspace.keep();
                }
                info!(
                    job_id = %job_id,
                    uploaded_files = report.uploaded_files,
                    duration = report.result.duration,
                    "Transcode job completed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %format!("{:#}", e), "Transcode job failed");
                if self.settings.keep_failed_output {
                    workspace.keep();
                } else if let Err(release_err) = workspace.release().await {
                    warn!(job_id = %job_id, error = %release_err, "Failed to remove workspace");
                }
                Err(e)
            }
        }
    }

    async fn run_job(
        &self,
        job: &TranscodeJob,
        workspace: &JobWorkspace,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<JobReport> {
        let input = self
            .fetcher
            .fetch(&job.source, &workspace.source_dir(), cancel)
            .await
            .with_context(|| format!("Failed to fetch source {}", job.source))?;

        let output_dir = workspace.output_dir();
        let pipeline = TranscodePipeline::from_settings(&self.settings, job.gpu);
        let result = pipeline
            .run(&input, &output_dir, events, cancel)
            .await
            .context("Transcode failed")?;

        let (uploaded_files, destination_prefix) = match &self.uploader {
            Some(uploader) => {
                let prefix = job
                    .destination_prefix
                    .clone()
                    .unwrap_or_else(|| job.job_id.to_string());
                let summary = tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("Upload cancelled"),
                    summary = uploader.upload_tree(&output_dir, &prefix) => {
                        summary.context("Failed to upload transcoded output")?
                    }
                };
                (summary.files, Some(prefix))
            }
            None => (0, None),
        };

        Ok(JobReport {
            job_id: job.job_id,
            result,
            uploaded_files,
            destination_prefix,
            output_dir: None,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn worker_in(work_dir: &std::path::Path, keep_failed_output: bool) -> TranscodeWorker {
        let mut vars = HashMap::new();
        vars.insert(
            "TRANSCODER_WORK_DIR".to_string(),
            work_dir.display().to_string(),
        );
        let mut config = AppConfig::from_vars(vars).unwrap();
        config.transcoder.keep_failed_output = keep_failed_output;
        TranscodeWorker::new(config.transcoder, SourceFetcher::new(None), None)
    }

    #[tokio::test]
    async fn test_invalid_job_is_rejected_before_workspace() {
        let base = tempfile::tempdir().unwrap();
        let worker = worker_in(base.path(), false);

        let job = TranscodeJob::new("");
        let err = worker
            .process(&job, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Invalid transcode job"));
        assert!(!base.path().join(job.job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_workspace() {
        let base = tempfile::tempdir().unwrap();
        let worker = worker_in(base.path(), false);

        let job = TranscodeJob::new("/nonexistent/input.mp4");
        let err = worker
            .process(&job, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Source file not found"));
        assert!(!base.path().join(job.job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_failed_job_workspace_can_be_kept() {
        let base = tempfile::tempdir().unwrap();
        let worker = worker_in(base.path(), true);

        let job = TranscodeJob::new("ftp://example.com/input.mp4");
        let err = worker
            .process(&job, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Unsupported URL scheme"));
        assert!(base.path().join(job.job_id.to_string()).join("source").is_dir());
    }
}
