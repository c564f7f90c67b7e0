//! Media inspection through ffprobe
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
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metadata::SourceMetadata;
use crate::runner::format_command;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("ffprobe failed with {code}: {stderr}")]
    Failed { code: String, stderr: String },

    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("probe was cancelled")]
    Cancelled,

    #[error("failed to run ffprobe: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the media-inspection tool and parses its JSON report
#[derive(Debug, Clone)]
pub struct MetadataProbe {
    program: PathBuf,
}

impl MetadataProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(input: &Path) -> Vec<String> {
        vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            input.to_string_lossy().to_string(),
        ]
    }

    pub async fn probe(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<SourceMetadata, ProbeError> {
        let args = Self::args(input);
        info!(command = %format_command(&self.program, &args), "Probing source");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // dropping the output future kills the child
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let meta = SourceMetadata::from_probe_json(&output.stdout)?;
        debug!(
            streams = meta.streams.len(),
            duration = ?meta.duration,
            bit_rate = ?meta.bit_rate,
            "Probe complete"
        );
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_args() {
        let args = MetadataProbe::args(Path::new("/tmp/in.mp4"));
        assert_eq!(
            args,
            ["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams", "/tmp/in.mp4"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let probe = MetadataProbe::new("/nonexistent/ffprobe");
        let result = probe
            .probe(Path::new("/tmp/in.mp4"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }
}
