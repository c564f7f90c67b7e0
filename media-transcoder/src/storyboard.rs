//! Storyboard sprite sheet and WebVTT thumbnail track
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


use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::host_path;
use crate::metadata::SourceMetadata;
use crate::runner::{EventSink, ProcessError, ProcessRunner};

pub const TILE_WIDTH: u32 = 180;
/// Seconds between thumbnails
pub const INTERVAL_SECS: u32 = 2;
pub const COLUMNS: u32 = 10;
pub const IMAGE_NAME: &str = "storyboard.jpg";
pub const VTT_NAME: &str = "storyboard.vtt";

#[derive(Error, Debug)]
pub enum StoryboardError {
    #[error("source has no usable video stream")]
    NoVideo,

    #[error("source duration is unknown")]
    UnknownDuration,

    #[error("source is shorter than one storyboard interval ({0:.3}s)")]
    TooShort(f64),

    #[error("sprite sheet encode failed: {0}")]
    Encode(#[from] ProcessError),

    #[error("failed to write cue file: {0}")]
    Io(#[from] std::io::Error),
}

/// Grid geometry derived from the source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoryboardLayout {
    pub tile_width: u32,
    pub tile_height: u32,
    pub columns: u32,
    pub rows: u32,
    pub frames: u32,
    /// Keep every n-th source frame
    pub frame_step: u32,
}

impl StoryboardLayout {
    pub fn for_source(meta: &SourceMetadata) -> Result<Self, StoryboardError> {
        let video = meta.video_stream().ok_or(StoryboardError::NoVideo)?;
        let (width, height) = match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(StoryboardError::NoVideo),
        };
        let fps = video
            .frame_rate
            .map(|f| f.as_f64())
            .ok_or(StoryboardError::NoVideo)?;
        let duration = meta.duration_secs().ok_or(StoryboardError::UnknownDuration)?;

        let frames = (duration / INTERVAL_SECS as f64).floor() as u32;
        if frames == 0 {
            return Err(StoryboardError::TooShort(duration));
        }

        let tile_height = (TILE_WIDTH as f64 * height as f64 / width as f64).floor() as u32;
        let tile_height = (tile_height - tile_height % 2).max(2);

        Ok(Self {
            tile_width: TILE_WIDTH,
            tile_height,
            columns: COLUMNS,
            rows: frames.div_ceil(COLUMNS),
            frames,
            frame_step: ((fps * INTERVAL_SECS as f64).round() as u32).max(1),
        })
    }

    /// Sprite region `(x, y, w, h)` of frame `i`
    pub fn region(&self, i: u32) -> (u32, u32, u32, u32) {
        let column = i % self.columns;
        let row = i / self.columns;
        (
            column * self.tile_width,
            row * self.tile_height,
            self.tile_width,
            self.tile_height,
        )
    }
}

/// Encoder arguments for the single-frame sprite sheet
pub fn sprite_args(input: &Path, image: &Path, layout: &StoryboardLayout) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        host_path(input),
        "-an".to_string(),
        "-sn".to_string(),
        "-vf".to_string(),
        format!(
            "select=not(mod(n\\,{})),scale={}:{},tile={}x{}",
            layout.frame_step, layout.tile_width, layout.tile_height, layout.columns, layout.rows
        ),
        "-frames:v".to_string(),
        "1".to_string(),
        "-q:v".to_string(),
        "2".to_string(),
        host_path(image),
    ]
}

/// `HH:MM:SS.mmm`
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        ms
    )
}

/// WebVTT document mapping each interval to its sprite region
pub fn cue_file(layout: &StoryboardLayout, image_name: &str) -> String {
    let mut vtt = String::from("WEBVTT\n");
    for i in 0..layout.frames {
        let start = (i * INTERVAL_SECS) as f64;
        let end = ((i + 1) * INTERVAL_SECS) as f64;
        let (x, y, w, h) = layout.region(i);
        // writing to a String cannot fail
        let _ = write!(
            vtt,
            "\n{} --> {}\n{}#xywh={},{},{},{}\n",
            format_timestamp(start),
            format_timestamp(end),
            image_name,
            x,
            y,
            w,
            h
        );
    }
    vtt
}

/// Paths of a generated storyboard
#[derive(Debug, Clone, PartialEq)]
pub struct StoryboardOutput {
    pub image: PathBuf,
    pub vtt: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoryboardGenerator {
    runner: ProcessRunner,
}

impl StoryboardGenerator {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    pub async fn generate(
        &self,
        input: &Path,
        output_dir: &Path,
        meta: &SourceMetadata,
        sink: Option<&dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<StoryboardOutput, StoryboardError> {
        let layout = StoryboardLayout::for_source(meta)?;
        let image = output_dir.join(IMAGE_NAME);
        let vtt = output_dir.join(VTT_NAME);

        info!(
            frames = layout.frames,
            rows = layout.rows,
            tile_height = layout.tile_height,
            "Generating storyboard"
        );

        self.runner
            .execute(&sprite_args(input, &image, &layout), sink, cancel)
            .await?;
        tokio::fs::write(&vtt, cue_file(&layout, IMAGE_NAME)).await?;

        Ok(StoryboardOutput { image, vtt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CodecType, FrameRate, StreamInfo};

    fn meta(width: u32, height: u32, fps: FrameRate, duration: Option<f64>) -> SourceMetadata {
        SourceMetadata {
            streams: vec![StreamInfo {
                index: 0,
                codec_type: CodecType::Video,
                codec_name: Some("h264".to_string()),
                width: Some(width),
                height: Some(height),
                frame_rate: Some(fps),
                channels: None,
                language: None,
                title: None,
                duration: None,
                bit_rate: None,
            }],
            duration,
            bit_rate: Some(1_000_000),
        }
    }

    #[test]
    fn test_layout_for_1080p() {
        let layout =
            StoryboardLayout::for_source(&meta(1920, 1080, FrameRate { num: 30, den: 1 }, Some(45.5)))
                .unwrap();

        assert_eq!(layout.tile_height, 100);
        assert_eq!(layout.frames, 22);
        assert_eq!(layout.rows, 3);
        assert_eq!(layout.frame_step, 60);
        assert_eq!(layout.region(0), (0, 0, 180, 100));
        assert_eq!(layout.region(13), (540, 100, 180, 100));
    }

    #[test]
    fn test_odd_tile_height_is_even() {
        // 180 * 3 / 4 = 135
        let layout =
            StoryboardLayout::for_source(&meta(640, 480, FrameRate { num: 25, den: 1 }, Some(10.0)))
                .unwrap();
        assert_eq!(layout.tile_height, 134);
        assert_eq!(layout.frame_step, 50);
    }

    #[test]
    fn test_too_short_source() {
        let result =
            StoryboardLayout::for_source(&meta(1280, 720, FrameRate { num: 30, den: 1 }, Some(1.5)));
        assert!(matches!(result, Err(StoryboardError::TooShort(_))));

        let unknown =
            StoryboardLayout::for_source(&meta(1280, 720, FrameRate { num: 30, den: 1 }, None));
        assert!(matches!(unknown, Err(StoryboardError::UnknownDuration)));
    }

    #[test]
    fn test_sprite_args() {
        let layout =
            StoryboardLayout::for_source(&meta(1920, 1080, FrameRate { num: 30, den: 1 }, Some(45.5)))
                .unwrap();
        let args = sprite_args(Path::new("/in/a.mp4"), Path::new("/out/storyboard.jpg"), &layout);
        assert_eq!(
            args,
            [
                "-hide_banner",
                "-y",
                "-i",
                "/in/a.mp4",
                "-an",
                "-sn",
                "-vf",
                r"select=not(mod(n\,60)),scale=180:100,tile=10x3",
                "-frames:v",
                "1",
                "-q:v",
                "2",
                "/out/storyboard.jpg"
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_sprite_args_keep_host_paths() {
        let layout =
            StoryboardLayout::for_source(&meta(1920, 1080, FrameRate { num: 30, den: 1 }, Some(45.5)))
                .unwrap();
        let args = sprite_args(
            Path::new(r"/in/my\clip.mp4"),
            Path::new(r"/out/odd\dir/storyboard.jpg"),
            &layout,
        );
        assert_eq!(args[3], r"/in/my\clip.mp4");
        assert_eq!(args[args.len() - 1], r"/out/odd\dir/storyboard.jpg");
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(62.5), "00:01:02.500");
        assert_eq!(format_timestamp(3725.0), "01:02:05.000");
    }

    #[test]
    fn test_cue_file() {
        let layout =
            StoryboardLayout::for_source(&meta(1920, 1080, FrameRate { num: 30, den: 1 }, Some(24.0)))
                .unwrap();
        let vtt = cue_file(&layout, IMAGE_NAME);

        assert!(vtt.starts_with("WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nstoryboard.jpg#xywh=0,0,180,100\n"));
        assert!(vtt.contains("00:00:20.000 --> 00:00:22.000\nstoryboard.jpg#xywh=0,100,180,100\n"));
        assert_eq!(vtt.matches("#xywh=").count(), 12);
    }
}
