//! Job and manifest schemas
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use uuid::Uuid;

use crate::error::{Result, TypesError};

// ============================================================================
// Job Payloads
// ============================================================================

/// A single transcode request as handed over by the job queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub job_id: Uuid,
    /// Local path or `s3://bucket/key`
    pub source: String,
    /// Object-storage prefix for the packaged output; `None` skips the upload
    #[serde(default)]
    pub destination_prefix: Option<String>,
    /// Overrides the configured GPU mode for this job
    #[serde(default)]
    pub gpu: Option<bool>,
}

impl TranscodeJob {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source: source.into(),
            destination_prefix: None,
            gpu: None,
        }
    }

    /// Reject payloads the pipeline cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(TypesError::MissingField("source".to_string()));
        }

        if let Some(prefix) = &self.destination_prefix {
            if prefix.starts_with('/') || prefix.starts_with('\\') {
                return Err(TypesError::Validation(format!(
                    "destination prefix must be relative: {}",
                    prefix
                )));
            }
            let escapes = Path::new(prefix)
                .components()
                .any(|c| matches!(c, Component::ParentDir));
            if escapes || prefix.split(['/', '\\']).any(|seg| seg == "..") {
                return Err(TypesError::Validation(format!(
                    "destination prefix must not contain '..': {}",
                    prefix
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Asset Manifest
// ============================================================================

/// One encoded video rendition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAsset {
    pub index: usize,
    pub part: usize,
    pub fps: f64,
    pub output: String,
    pub bitrate: u32, // kbps
    pub name: String,
    pub width: u32,
    pub profile: String,
    pub height: u32,
    pub level: String,
    #[serde(default)]
    pub playlist: Option<String>,
}

/// One encoded audio output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub index: usize,
    pub part: usize,
    pub default: bool,
    pub output: String,
    pub channels: u32,
    /// Target bitrate in kbps; `None` when the encoder default is kept
    #[serde(rename = "bitrates")]
    pub bitrate: Option<u32>,
    pub language: String,
    pub title: String,
    pub codec: String,
    /// Whether the packager segments this output into the HLS tree
    pub packaged: bool,
    #[serde(default)]
    pub playlist: Option<String>,
}

/// One extracted subtitle track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleAsset {
    pub index: usize,
    pub part: usize,
    pub default: bool,
    pub output: String,
    pub language: String,
    pub title: String,
    pub codec: String,
    #[serde(default)]
    pub playlist: Option<String>,
}

/// Every asset an encode plan produces, grouped by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub video: Vec<VideoAsset>,
    pub audio: Vec<AudioAsset>,
    pub subtitle: Vec<SubtitleAsset>,
}

impl Manifest {
    /// Derive a manifest whose paths are relative to `root`.
    ///
    /// Paths that do not live under `root` are kept as they are. The
    /// receiver is left untouched.
    pub fn relative_to(&self, root: &str) -> Manifest {
        let rel = |path: &str| relative_path(path, root);
        let rel_opt = |path: &Option<String>| path.as_deref().map(|p| relative_path(p, root));

        Manifest {
            video: self
                .video
                .iter()
                .map(|v| VideoAsset {
                    output: rel(&v.output),
                    playlist: rel_opt(&v.playlist),
                    ..v.clone()
                })
                .collect(),
            audio: self
                .audio
                .iter()
                .map(|a| AudioAsset {
                    output: rel(&a.output),
                    playlist: rel_opt(&a.playlist),
                    ..a.clone()
                })
                .collect(),
            subtitle: self
                .subtitle
                .iter()
                .map(|s| SubtitleAsset {
                    output: rel(&s.output),
                    playlist: rel_opt(&s.playlist),
                    ..s.clone()
                })
                .collect(),
        }
    }

    /// Audio outputs handed to the packager
    pub fn packaged_audio(&self) -> impl Iterator<Item = &AudioAsset> {
        self.audio.iter().filter(|a| a.packaged)
    }

    /// All output paths, in part order
    pub fn outputs(&self) -> Vec<&str> {
        self.video
            .iter()
            .map(|v| v.output.as_str())
            .chain(self.audio.iter().map(|a| a.output.as_str()))
            .chain(self.subtitle.iter().map(|s| s.output.as_str()))
            .collect()
    }
}

fn relative_path(path: &str, root: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
        _ => path.to_string(),
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardAssets {
    pub image: String,
    pub vtt: String,
}

/// Outcome of one pipeline run, paths relative to the output root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeResult {
    pub duration: f64, // seconds
    #[serde(flatten)]
    pub manifest: Manifest,
    /// Master playlist
    pub hls: String,
    pub storyboard: StoryboardAssets,
}

/// What the worker reports back for a finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub result: TranscodeResult,
    /// Number of files uploaded, 0 when the upload was skipped
    pub uploaded_files: usize,
    pub destination_prefix: Option<String>,
    /// Local output directory, kept when nothing was uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            video: vec![VideoAsset {
                index: 0,
                part: 0,
                fps: 30.0,
                output: "/work/job/output/video_0.mp4".to_string(),
                bitrate: 4500,
                name: "1080p".to_string(),
                width: 1920,
                profile: "high".to_string(),
                height: 1080,
                level: "4.1".to_string(),
                playlist: Some("/work/job/output/video_0.m3u8".to_string()),
            }],
            audio: vec![AudioAsset {
                index: 0,
                part: 1,
                default: true,
                output: "/work/job/output/audio_0.mp4".to_string(),
                channels: 2,
                bitrate: Some(160),
                language: "en".to_string(),
                title: "Track_1".to_string(),
                codec: "aac".to_string(),
                packaged: true,
                playlist: None,
            }],
            subtitle: vec![],
        }
    }

    #[test]
    fn test_relative_to_strips_root() {
        let manifest = sample_manifest();
        let relative = manifest.relative_to("/work/job/output/");

        assert_eq!(relative.video[0].output, "video_0.mp4");
        assert_eq!(relative.video[0].playlist.as_deref(), Some("video_0.m3u8"));
        assert_eq!(relative.audio[0].output, "audio_0.mp4");
        // original is untouched
        assert_eq!(manifest.video[0].output, "/work/job/output/video_0.mp4");
    }

    #[test]
    fn test_relative_to_keeps_foreign_paths() {
        let manifest = sample_manifest();
        let relative = manifest.relative_to("/work/job/out");
        assert_eq!(relative.video[0].output, "/work/job/output/video_0.mp4");
    }

    #[test]
    fn test_result_serializes_flat() {
        let result = TranscodeResult {
            duration: 12.5,
            manifest: sample_manifest().relative_to("/work/job/output"),
            hls: "master.m3u8".to_string(),
            storyboard: StoryboardAssets {
                image: "storyboard.jpg".to_string(),
                vtt: "storyboard.vtt".to_string(),
            },
        };

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("video").is_some());
        assert!(json.get("manifest").is_none());
        assert_eq!(json["audio"][0]["bitrates"], 160);
        assert_eq!(json["storyboard"]["vtt"], "storyboard.vtt");

        let back: TranscodeResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_job_validation() {
        let mut job = TranscodeJob::new("s3://bucket/videos/in.mp4");
        assert!(job.validate().is_ok());

        job.destination_prefix = Some("videos/abc".to_string());
        assert!(job.validate().is_ok());

        job.destination_prefix = Some("/abs/path".to_string());
        assert!(matches!(job.validate(), Err(TypesError::Validation(_))));

        job.destination_prefix = Some("videos/../other".to_string());
        assert!(matches!(job.validate(), Err(TypesError::Validation(_))));

        let empty = TranscodeJob::new("  ");
        assert!(matches!(empty.validate(), Err(TypesError::MissingField(_))));
    }

    #[test]
    fn test_parse_job_payload() {
        let job = crate::error::parse_job(
            br#"{"job_id":"0b6f4c1e-8a57-4f0e-9d3a-2c5b7e9f1a24","source":"s3://bucket/in.mp4","gpu":true}"#,
        )
        .unwrap();
        assert_eq!(job.source, "s3://bucket/in.mp4");
        assert_eq!(job.gpu, Some(true));
        assert_eq!(job.destination_prefix, None);

        let malformed = crate::error::parse_job(br#"{"source":"in.mp4"}"#);
        assert!(matches!(malformed, Err(TypesError::Serialization(_))));

        let blank = crate::error::parse_job(
            br#"{"job_id":"0b6f4c1e-8a57-4f0e-9d3a-2c5b7e9f1a24","source":""}"#,
        );
        assert!(matches!(blank, Err(TypesError::MissingField(_))));
    }
}
