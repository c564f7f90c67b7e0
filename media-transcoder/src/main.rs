//! Media Transcoder
//!
//! Runs a single VOD transcode job from the command line:
//! - Fetches the source (local path or `s3://bucket/key`)
//! - Encodes the adaptive ladder and packages it as HLS
//! - Generates the storyboard sprite and cue file
//! - Uploads the output tree to object storage
//! - Prints the job report as JSON on stdout
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


use anyhow::{Context, Result};
use clap::Parser;
use media_transcoder::pipeline::{PipelineError, PipelineEvent};
use media_transcoder::runner::RunEvent;
use media_transcoder::worker::TranscodeWorker;
use std::collections::HashMap;
use std::path::PathBuf;
use streamforge_config::AppConfig;
use streamforge_logging::{init_from_format, LogFormat};
use streamforge_types::{parse_job, TranscodeJob};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "media-transcoder", version, about = "Transcode a video into an HLS ladder")]
struct Args {
    /// Local path, file:// or s3://bucket/key
    #[arg(long, required_unless_present = "job", conflicts_with = "job")]
    source: Option<String>,

    /// JSON job payload; the flags below override its fields
    #[arg(long, value_name = "FILE")]
    job: Option<PathBuf>,

    /// Job id, generated when omitted
    #[arg(long)]
    job_id: Option<Uuid>,

    /// Object key prefix for the uploaded output (defaults to the job id)
    #[arg(long)]
    prefix: Option<String>,

    /// Encode with h264_nvenc regardless of TRANSCODER_GPU
    #[arg(long)]
    gpu: bool,

    /// Keep the output locally instead of uploading it
    #[arg(long)]
    no_upload: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        config.transcoder.log_format.parse().unwrap_or_default()
    };
    init_from_format(format, "media-transcoder", config.log_level());

    info!(
        ffmpeg = %config.transcoder.ffmpeg_path.display(),
        packager = %config.transcoder.packager_path.display(),
        work_dir = %config.transcoder.work_dir.display(),
        segment_duration = config.transcoder.segment_duration,
        "Configuration loaded"
    );

    let worker = TranscodeWorker::from_config(&config, !args.no_upload)?;

    let job = load_job(&args)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, cancelling job");
                shutdown.cancel();
            }
            Err(err) => {
                error!(error = %err, "Unable to listen for shutdown signal");
            }
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let logger = tokio::spawn(log_events(rx));

    let outcome = worker.process(&job, Some(&tx), &cancel).await;
    drop(tx);
    let _ = logger.await;

    match outcome {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report).context("Failed to encode job report")?;
            println!("{}", json);
            Ok(())
        }
        Err(e) => {
            let cancelled = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::is_cancelled)
                .unwrap_or(false)
                || cancel.is_cancelled();
            if cancelled {
                warn!(job_id = %job.job_id, "Job cancelled");
            }
            Err(e)
        }
    }
}

fn load_job(args: &Args) -> Result<TranscodeJob> {
    let mut job = match (&args.job, &args.source) {
        (Some(path), _) => {
            let payload = std::fs::read(path)
                .with_context(|| format!("Failed to read job file {}", path.display()))?;
            parse_job(&payload)
                .with_context(|| format!("Invalid job file {}", path.display()))?
        }
        (None, Some(source)) => TranscodeJob::new(source.clone()),
        (None, None) => anyhow::bail!("either --source or --job is required"),
    };

    if let Some(job_id) = args.job_id {
        job.job_id = job_id;
    }
    if args.prefix.is_some() {
        job.destination_prefix = args.prefix.clone();
    }
    if args.gpu {
        job.gpu = Some(true);
    }
    Ok(job)
}

/// Log pipeline events, progress once per 10% step and stage
async fn log_events(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
    let mut reported: HashMap<String, u32> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::State(state) => debug!(state = ?state, "State changed"),
            PipelineEvent::Process { stage, event } => match event {
                RunEvent::Started { command } => {
                    debug!(stage = %stage, command = %command, "Process started")
                }
                RunEvent::Progress(progress) => {
                    let Some(percent) = progress.percent else {
                        continue;
                    };
                    let step = percent / 10 * 10;
                    let key = stage.to_string();
                    if reported.get(&key).map_or(true, |last| step > *last) {
                        reported.insert(key, step);
                        info!(stage = %stage, percent = step, fps = ?progress.fps, "Progress");
                    }
                }
                RunEvent::Finished => info!(stage = %stage, "Process finished"),
                RunEvent::Failed { message } => {
                    error!(stage = %stage, error = %message, "Process failed")
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"job_id":"5f0c8a3e-2b1d-4c7e-9a6f-1d2e3f4a5b6c","source":"s3://media/in.mp4","destination_prefix":"vod/in"}"#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "media-transcoder",
            "--job",
            path.to_str().unwrap(),
            "--gpu",
        ])
        .unwrap();
        let job = load_job(&args).unwrap();

        assert_eq!(job.job_id.to_string(), "5f0c8a3e-2b1d-4c7e-9a6f-1d2e3f4a5b6c");
        assert_eq!(job.source, "s3://media/in.mp4");
        assert_eq!(job.destination_prefix.as_deref(), Some("vod/in"));
        assert_eq!(job.gpu, Some(true));
    }

    #[test]
    fn test_invalid_job_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"job_id":"5f0c8a3e-2b1d-4c7e-9a6f-1d2e3f4a5b6c","source":"in.mp4","destination_prefix":"../up"}"#,
        )
        .unwrap();

        let args = Args::try_parse_from(["media-transcoder", "--job", path.to_str().unwrap()]).unwrap();
        let err = load_job(&args).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid job file"));
    }

    #[test]
    fn test_source_or_job_is_required() {
        assert!(Args::try_parse_from(["media-transcoder"]).is_err());
        assert!(Args::try_parse_from(["media-transcoder", "--source", "a.mp4", "--job", "j.json"]).is_err());

        let args = Args::try_parse_from(["media-transcoder", "--source", "a.mp4", "--prefix", "x"]).unwrap();
        let job = load_job(&args).unwrap();
        assert_eq!(job.source, "a.mp4");
        assert_eq!(job.destination_prefix.as_deref(), Some("x"));
        assert_eq!(job.gpu, None);
    }
}
