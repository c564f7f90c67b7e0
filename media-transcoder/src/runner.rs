//! Subprocess runner for the encoder and the packager
//!
//! Every run reports a typed event stream (`RunEvent`) to an optional
//! `EventSink` and resolves to `Ok(())` only on a zero exit status.
//! Cancellation kills the child and resolves to `ProcessError::Cancelled`.
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


use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Maximum amount of stderr kept for error reports
const STDERR_TAIL_BYTES: usize = 64 * 1024;

const DURATION_PATTERN: &str = r"Duration: (\d{2}):(\d{2}):(\d{2}(?:\.\d+)?)";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code}: {stderr_tail}")]
    Exited {
        program: String,
        code: String,
        stderr_tail: String,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ProcessError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}

/// One parsed progress update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// `round(out_time / duration * 100)`, capped at 100; `None` until the duration is known
    pub percent: Option<u32>,
    /// Output position in seconds
    pub out_time: Option<f64>,
    pub fps: Option<f64>,
    /// Bytes written so far
    pub total_size: Option<u64>,
}

/// Lifecycle of one subprocess run
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Emitted with the full command line before spawning
    Started { command: String },
    Progress(Progress),
    Finished,
    Failed { message: String },
}

/// Consumer of run events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

impl EventSink for mpsc::UnboundedSender<RunEvent> {
    fn emit(&self, event: RunEvent) {
        // receiver may be gone, events are best effort
        let _ = self.send(event);
    }
}

/// Spawns encoder and packager processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    encoder: PathBuf,
    packager: PathBuf,
}

impl ProcessRunner {
    pub fn new(encoder: impl Into<PathBuf>, packager: impl Into<PathBuf>) -> Self {
        Self {
            encoder: encoder.into(),
            packager: packager.into(),
        }
    }

    pub fn encoder(&self) -> &Path {
        &self.encoder
    }

    /// Run the encoder. With a sink attached, machine-readable progress is requested.
    pub async fn execute(
        &self,
        args: &[String],
        sink: Option<&dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let mut full_args = Vec::with_capacity(args.len() + 2);
        if sink.is_some() {
            full_args.push("-progress".to_string());
            full_args.push("pipe:2".to_string());
        }
        full_args.extend_from_slice(args);

        run_process(&self.encoder, &full_args, sink, cancel).await
    }

    /// Run the packager
    pub async fn package(
        &self,
        args: &[String],
        sink: Option<&dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        run_process(&self.packager, args, sink, cancel).await
    }
}

/// Shell-style rendering of a command line, for logs and `Started` events
pub fn format_command(program: &Path, args: &[String]) -> String {
    let mut line = quote_arg(&program.to_string_lossy());
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(arg));
    }
    line
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

enum Outcome {
    Exited(ExitStatus),
    Cancelled,
    Io(std::io::Error),
}

async fn run_process(
    program: &Path,
    args: &[String],
    sink: Option<&dyn EventSink>,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let program_name = program.to_string_lossy().to_string();
    let command_line = format_command(program, args);

    let result = drive(program, &program_name, &command_line, args, sink, cancel).await;

    match &result {
        Ok(()) => {
            debug!(program = %program_name, "Process finished");
            if let Some(sink) = sink {
                sink.emit(RunEvent::Finished);
            }
        }
        Err(e) => {
            if e.is_cancelled() {
                info!(program = %program_name, "Process cancelled");
            } else {
                error!(program = %program_name, error = %e, "Process failed");
            }
            if let Some(sink) = sink {
                sink.emit(RunEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
    }

    result
}

async fn drive(
    program: &Path,
    program_name: &str,
    command_line: &str,
    args: &[String],
    sink: Option<&dyn EventSink>,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let mut run = ProcessRun::new()?;

    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled {
            program: program_name.to_string(),
        });
    }

    info!(command = %command_line, "Spawning process");
    if let Some(sink) = sink {
        sink.emit(RunEvent::Started {
            command: command_line.to_string(),
        });
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program_name.to_string(),
            source,
        })?;

    let outcome = match child.stderr.take() {
        Some(stderr) => {
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Outcome::Cancelled,
                    segment = segments.next_segment() => match segment {
                        Ok(Some(bytes)) => {
                            for progress in run.ingest(&String::from_utf8_lossy(&bytes)) {
                                debug!(
                                    program = %program_name,
                                    percent = ?progress.percent,
                                    out_time = ?progress.out_time,
                                    "Progress"
                                );
                                if let Some(sink) = sink {
                                    sink.emit(RunEvent::Progress(progress));
                                }
                            }
                        }
                        Ok(None) => break wait_for_exit(&mut child, cancel).await,
                        Err(e) => break Outcome::Io(e),
                    }
                }
            }
        }
        None => wait_for_exit(&mut child, cancel).await,
    };

    match outcome {
        Outcome::Exited(status) if status.success() => Ok(()),
        Outcome::Exited(status) => Err(ProcessError::Exited {
            program: program_name.to_string(),
            code: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr_tail: run.stderr_tail(),
        }),
        Outcome::Cancelled => {
            // already exited processes make kill fail, which is fine
            let _ = child.kill().await;
            Err(ProcessError::Cancelled {
                program: program_name.to_string(),
            })
        }
        Outcome::Io(source) => {
            let _ = child.kill().await;
            Err(ProcessError::Io {
                program: program_name.to_string(),
                source,
            })
        }
    }
}

async fn wait_for_exit(child: &mut tokio::process::Child, cancel: &CancellationToken) -> Outcome {
    tokio::select! {
        _ = cancel.cancelled() => Outcome::Cancelled,
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status),
            Err(e) => Outcome::Io(e),
        },
    }
}

/// State of one subprocess's stderr stream
struct ProcessRun {
    duration_re: Regex,
    duration: Option<f64>,
    tail: VecDeque<String>,
    tail_bytes: usize,
    pending: Progress,
}

impl ProcessRun {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            duration_re: Regex::new(DURATION_PATTERN)?,
            duration: None,
            tail: VecDeque::new(),
            tail_bytes: 0,
            pending: Progress::default(),
        })
    }

    /// Feed one `\n`-terminated chunk; `\r` separated stats updates are split apart
    fn ingest(&mut self, chunk: &str) -> Vec<Progress> {
        let mut updates = Vec::new();
        for line in chunk.split('\r') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.remember(line);
            if let Some(progress) = self.parse_line(line) {
                updates.push(progress);
            }
        }
        updates
    }

    fn remember(&mut self, line: &str) {
        self.tail_bytes += line.len() + 1;
        self.tail.push_back(line.to_string());
        while self.tail_bytes > STDERR_TAIL_BYTES && self.tail.len() > 1 {
            if let Some(old) = self.tail.pop_front() {
                self.tail_bytes -= old.len() + 1;
            }
        }
    }

    fn stderr_tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn parse_line(&mut self, line: &str) -> Option<Progress> {
        if self.duration.is_none() {
            if let Some(caps) = self.duration_re.captures(line) {
                let hours: f64 = caps[1].parse().unwrap_or(0.0);
                let minutes: f64 = caps[2].parse().unwrap_or(0.0);
                let seconds: f64 = caps[3].parse().unwrap_or(0.0);
                self.duration = Some(hours * 3600.0 + minutes * 60.0 + seconds);
                return None;
            }
        }

        let (key, value) = line.split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "out_time_us" | "out_time_ms" => {
                // both report microseconds
                if let Ok(us) = value.parse::<i64>() {
                    self.pending.out_time = Some(us.max(0) as f64 / 1_000_000.0);
                }
            }
            "out_time" => {
                if self.pending.out_time.is_none() {
                    self.pending.out_time = parse_clock(value);
                }
            }
            "fps" => self.pending.fps = value.parse().ok(),
            "total_size" => self.pending.total_size = value.parse().ok(),
            "progress" => {
                let mut progress = std::mem::take(&mut self.pending);
                progress.percent = match (progress.out_time, self.duration) {
                    (Some(current), Some(total)) if total > 0.0 => {
                        Some(((current / total) * 100.0).round().clamp(0.0, 100.0) as u32)
                    }
                    _ => None,
                };
                if value == "end" {
                    progress.percent = Some(100);
                }
                return Some(progress);
            }
            _ => {}
        }
        None
    }
}

/// `HH:MM:SS.micro` to seconds
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
