//! Transcoding pipeline
//!
//! Drives one job through probe, planning, concurrent encode parts and
//! concurrent packaging plus storyboard generation, and reports state
//! changes and per-process events on an optional channel.
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


use futures::future::join_all;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use streamforge_config::TranscoderSettings;
use streamforge_types::{StoryboardAssets, TranscodeResult};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::{to_slash, CommandBuilder, EncodePlan};
use crate::ladder::PlanError;
use crate::probe::{MetadataProbe, ProbeError};
use crate::runner::{format_command, EventSink, ProcessError, ProcessRunner, RunEvent};
use crate::storyboard::{StoryboardError, StoryboardGenerator};

/// Where a process event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Encode { part: usize },
    Package,
    Storyboard,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Probe => write!(f, "probe"),
            Stage::Encode { part } => write!(f, "encode[{}]", part),
            Stage::Package => write!(f, "package"),
            Stage::Storyboard => write!(f, "storyboard"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Probing,
    Planning,
    Encoding,
    PackagingAndStoryboard,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    State(JobState),
    Process { stage: Stage, event: RunEvent },
}

/// Tags runner events with their stage
struct StageSink<'a> {
    events: &'a mpsc::UnboundedSender<PipelineEvent>,
    stage: Stage,
}

impl EventSink for StageSink<'_> {
    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(PipelineEvent::Process {
            stage: self.stage,
            event,
        });
    }
}

/// One failed encode part
#[derive(Debug)]
pub struct PartFailure {
    pub part: usize,
    pub error: ProcessError,
}

fn describe_failures(failures: &[PartFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("part {}: {}", f.part, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to prepare output directory: {0}")]
    Workspace(#[source] io::Error),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("{} encode part(s) failed: {}", .0.len(), describe_failures(.0))]
    Encode(Vec<PartFailure>),

    #[error("packaging failed: {0}")]
    Packaging(#[source] ProcessError),

    #[error("storyboard failed: {0}")]
    Storyboard(#[from] StoryboardError),
}

impl PipelineError {
    /// True when the failure came from the cancellation token
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Probe(ProbeError::Cancelled) => true,
            PipelineError::Encode(failures) => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_cancelled())
            }
            PipelineError::Packaging(e) => e.is_cancelled(),
            PipelineError::Storyboard(StoryboardError::Encode(e)) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Probe, plan, encode, package
#[derive(Debug, Clone)]
pub struct TranscodePipeline {
    probe: MetadataProbe,
    runner: ProcessRunner,
    builder: CommandBuilder,
    storyboard: StoryboardGenerator,
}

impl TranscodePipeline {
    pub fn new(probe: MetadataProbe, runner: ProcessRunner, builder: CommandBuilder) -> Self {
        let storyboard = StoryboardGenerator::new(runner.clone());
        Self {
            probe,
            runner,
            builder,
            storyboard,
        }
    }

    /// Build from configuration; `gpu` overrides the configured mode
    pub fn from_settings(settings: &TranscoderSettings, gpu: Option<bool>) -> Self {
        Self::new(
            MetadataProbe::new(&settings.ffprobe_path),
            ProcessRunner::new(&settings.ffmpeg_path, &settings.packager_path),
            CommandBuilder::new(gpu.unwrap_or(settings.gpu), settings.segment_duration),
        )
    }

    /// Run the whole pipeline for `input`, writing into `output_dir`.
    ///
    /// The output directory is wiped first. Partial output is left in place
    /// on failure and cancellation.
    pub async fn run(
        &self,
        input: &Path,
        output_dir: &Path,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, PipelineError> {
        let result = self.run_stages(input, output_dir, events, cancel).await;

        match &result {
            Ok(_) => {
                info!(output = %output_dir.display(), "Pipeline complete");
                emit_state(events, JobState::Done);
            }
            Err(e) => {
                error!(error = %e, "Pipeline failed");
                emit_state(events, JobState::Failed);
            }
        }
        result
    }

    async fn run_stages(
        &self,
        input: &Path,
        output_dir: &Path,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, PipelineError> {
        emit_state(events, JobState::Init);
        reset_dir(output_dir).await.map_err(PipelineError::Workspace)?;

        emit_state(events, JobState::Probing);
        let probe_sink = events.map(|tx| StageSink {
            events: tx,
            stage: Stage::Probe,
        });
        if let Some(sink) = &probe_sink {
            sink.emit(RunEvent::Started {
                command: format_command(self.probe.program(), &MetadataProbe::args(input)),
            });
        }
        let meta = match self.probe.probe(input, cancel).await {
            Ok(meta) => {
                if let Some(sink) = &probe_sink {
                    sink.emit(RunEvent::Finished);
                }
                meta
            }
            Err(e) => {
                if let Some(sink) = &probe_sink {
                    sink.emit(RunEvent::Failed {
                        message: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        emit_state(events, JobState::Planning);
        let duration = meta
            .duration_secs()
            .ok_or_else(|| PlanError::InvalidSource("source duration is unknown".to_string()))?;
        let plan = self.builder.build(input, output_dir, &meta)?;
        info!(
            renditions = plan.renditions.len(),
            parts = plan.parts.len(),
            audio = plan.manifest.audio.len(),
            subtitles = plan.manifest.subtitle.len(),
            gop = plan.gop,
            "Encode plan ready"
        );

        emit_state(events, JobState::Encoding);
        self.encode(&plan, events, cancel).await?;

        emit_state(events, JobState::PackagingAndStoryboard);
        prepare_segment_dirs(output_dir, &plan).await.map_err(PipelineError::Workspace)?;

        let package_sink = events.map(|tx| StageSink {
            events: tx,
            stage: Stage::Package,
        });
        let storyboard_sink = events.map(|tx| StageSink {
            events: tx,
            stage: Stage::Storyboard,
        });
        let (packaged, storyboard) = tokio::join!(
            self.runner
                .package(&plan.packager_args, as_sink(&package_sink), cancel),
            self.storyboard
                .generate(input, output_dir, &meta, as_sink(&storyboard_sink), cancel),
        );

        let storyboard = match (packaged, storyboard) {
            (Ok(()), Ok(storyboard)) => storyboard,
            (Err(e), Ok(_)) => return Err(PipelineError::Packaging(e)),
            (Ok(()), Err(e)) => return Err(e.into()),
            (Err(package_err), Err(storyboard_err)) => {
                warn!(error = %storyboard_err, "Storyboard also failed");
                return Err(PipelineError::Packaging(package_err));
            }
        };

        let root = to_slash(output_dir);
        let relative = |path: &Path| {
            let path = to_slash(path);
            match path.strip_prefix(root.trim_end_matches('/')) {
                Some(rest) => rest.trim_start_matches('/').to_string(),
                None => path,
            }
        };

        Ok(TranscodeResult {
            duration,
            manifest: plan.manifest.relative_to(&plan.output_dir),
            hls: relative(Path::new(&plan.master_playlist)),
            storyboard: StoryboardAssets {
                image: relative(&storyboard.image),
                vtt: relative(&storyboard.vtt),
            },
        })
    }

    /// Run every part concurrently and join all of them
    async fn encode(
        &self,
        plan: &EncodePlan,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let runs = plan.parts.iter().map(|part| {
            let sink = events.map(|tx| StageSink {
                events: tx,
                stage: Stage::Encode { part: part.index },
            });
            async move {
                info!(
                    part = part.index,
                    kind = ?part.kind,
                    "Starting encode part"
                );
                let result = self.runner.execute(&part.args, as_sink(&sink), cancel).await;
                (part.index, result)
            }
        });

        let failures: Vec<PartFailure> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|(part, result)| result.err().map(|error| PartFailure { part, error }))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Encode(failures))
        }
    }
}

fn as_sink<'a>(sink: &'a Option<StageSink<'_>>) -> Option<&'a dyn EventSink> {
    sink.as_ref().map(|s| s as &dyn EventSink)
}

fn emit_state(events: Option<&mpsc::UnboundedSender<PipelineEvent>>, state: JobState) {
    info!(state = ?state, "Job state");
    if let Some(tx) = events {
        let _ = tx.send(PipelineEvent::State(state));
    }
}

/// Remove and recreate `dir`
async fn reset_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// The packager writes segments into per-stream directories
async fn prepare_segment_dirs(out: &Path, plan: &EncodePlan) -> io::Result<()> {
    let mut dirs: Vec<String> = plan
        .manifest
        .video
        .iter()
        .map(|v| format!("video_{}", v.index))
        .collect();
    dirs.extend(
        plan.manifest
            .packaged_audio()
            .map(|a| format!("audio_{}", a.index)),
    );
    dirs.extend(
        plan.manifest
            .subtitle
            .iter()
            .map(|s| format!("subtitle_{}", s.index)),
    );
    for dir in dirs {
        tokio::fs::create_dir_all(out.join(dir)).await?;
    }
    Ok(())
}

/// Job-scoped working directory, removed on `release`
#[derive(Debug)]
pub struct JobWorkspace {
    root: PathBuf,
}

impl JobWorkspace {
    /// Wipe and recreate `<base>/<job_id>` with `source/` and `output/` inside
    pub async fn acquire(base: &Path, job_id: &str) -> io::Result<Self> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id == "." || job_id == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid job id for workspace: {:?}", job_id),
            ));
        }

        let root = base.join(job_id);
        reset_dir(&root).await?;
        tokio::fs::create_dir_all(root.join("source")).await?;
        tokio::fs::create_dir_all(root.join("output")).await?;
        info!(workspace = %root.display(), "Workspace acquired");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Delete the workspace
    pub async fn release(self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        info!(workspace = %self.root.display(), "Workspace released");
        Ok(())
    }

    /// Keep the workspace on disk and return its path
    pub fn keep(self) -> PathBuf {
        info!(workspace = %self.root.display(), "Keeping workspace");
        self.root
    }
}
