//! Quality ladder planning
//!
//! Picks the renditions to encode for a source: every label of the fixed
//! table at or below the best match for the source resolution, scaled to
//! the source aspect ratio, never upscaled.
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


use thiserror::Error;

use crate::metadata::{FrameRate, SourceMetadata};

/// A label matches when the source reaches 95% of its width or height
pub const MATCH_TOLERANCE: f64 = 0.05;
/// Applied on top of the area-scaled source bitrate
pub const QUALITY_FACTOR: f64 = 0.9;
/// Keyframe interval in seconds
pub const GOP_SECONDS: f64 = 3.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("source has no video stream")]
    NoVideoStream,

    #[error("invalid source: {0}")]
    InvalidSource(String),
}

/// One row of the quality table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityLevel {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub profile: &'static str,
    pub level: &'static str,
    /// Optimal bitrate ceiling in kbps
    pub max_bitrate: u32,
}

/// Ordered from lowest to highest resolution
pub static QUALITY_LADDER: [QualityLevel; 7] = [
    QualityLevel { name: "144p", width: 256, height: 144, profile: "baseline", level: "3.0", max_bitrate: 200 },
    QualityLevel { name: "240p", width: 426, height: 240, profile: "baseline", level: "3.0", max_bitrate: 400 },
    QualityLevel { name: "360p", width: 640, height: 360, profile: "main", level: "3.1", max_bitrate: 800 },
    QualityLevel { name: "480p", width: 854, height: 480, profile: "main", level: "3.1", max_bitrate: 1400 },
    QualityLevel { name: "720p", width: 1280, height: 720, profile: "high", level: "4.0", max_bitrate: 2800 },
    QualityLevel { name: "1080p", width: 1920, height: 1080, profile: "high", level: "4.1", max_bitrate: 5000 },
    QualityLevel { name: "1440p", width: 2560, height: 1440, profile: "high", level: "5.0", max_bitrate: 8000 },
];

pub fn quality_level(name: &str) -> Option<&'static QualityLevel> {
    QUALITY_LADDER.iter().find(|q| q.name == name)
}

/// One computed output rendition
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub profile: String,
    pub level: String,
    /// kbps
    pub bitrate: u32,
    pub fps: FrameRate,
}

/// Source properties the ladder depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceVideo {
    pub width: u32,
    pub height: u32,
    pub fps: FrameRate,
    pub bitrate_kbps: f64,
}

impl SourceVideo {
    pub fn from_metadata(meta: &SourceMetadata) -> Result<Self, PlanError> {
        let video = meta.video_stream().ok_or(PlanError::NoVideoStream)?;

        let (width, height) = match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(PlanError::InvalidSource(
                    "video stream has no dimensions".to_string(),
                ))
            }
        };
        let fps = video
            .frame_rate
            .ok_or_else(|| PlanError::InvalidSource("video stream has no frame rate".to_string()))?;
        let bitrate_kbps = meta
            .bitrate_kbps()
            .ok_or_else(|| PlanError::InvalidSource("container bit_rate is missing".to_string()))?;

        Ok(Self {
            width,
            height,
            fps,
            bitrate_kbps,
        })
    }

    /// Keyframe interval in frames
    pub fn gop(&self) -> u32 {
        ((self.fps.as_f64() * GOP_SECONDS).round() as u32).max(1)
    }
}

/// Highest label the source can fill, or the lowest label if none fits
pub fn best_match(width: u32, height: u32) -> &'static QualityLevel {
    let reaches = |source: u32, target: u32| source as f64 >= target as f64 * (1.0 - MATCH_TOLERANCE);

    QUALITY_LADDER
        .iter()
        .rev()
        .find(|q| reaches(height, q.height) || reaches(width, q.width))
        .unwrap_or(&QUALITY_LADDER[0])
}

fn floor_even(value: f64) -> u32 {
    let v = value.max(0.0).floor() as u32;
    (v - v % 2).max(2)
}

/// Aspect-preserving target size, never larger than the source
pub fn scale_dimensions(src_width: u32, src_height: u32, target: &QualityLevel) -> (u32, u32) {
    let ratio_h = target.height as f64 / src_height as f64;
    let ratio_w = target.width as f64 / src_width as f64;

    if ratio_h <= ratio_w {
        let height = floor_even(target.height.min(src_height) as f64);
        let width = floor_even(src_width as f64 * height as f64 / src_height as f64);
        (width, height)
    } else {
        let width = floor_even(target.width.min(src_width) as f64);
        let height = floor_even(src_height as f64 * width as f64 / src_width as f64);
        (width, height)
    }
}

/// Area-scaled source bitrate, capped by the label ceiling
pub fn target_bitrate(source: &SourceVideo, width: u32, height: u32, level: &QualityLevel) -> u32 {
    let area_ratio =
        (width as f64 * height as f64) / (source.width as f64 * source.height as f64);
    let estimate = (source.bitrate_kbps * area_ratio * QUALITY_FACTOR).round();
    if estimate.is_finite() && estimate > 0.0 {
        (estimate.min(level.max_bitrate as f64)) as u32
    } else {
        0
    }
}

/// 60 for HD sources at 60+, the source rate below 30, otherwise 30
pub fn target_fps(source_fps: FrameRate, height: u32) -> FrameRate {
    let fps = source_fps.as_f64();
    if fps >= 60.0 && height >= 720 {
        FrameRate { num: 60, den: 1 }
    } else if fps < 30.0 {
        source_fps
    } else {
        FrameRate { num: 30, den: 1 }
    }
}

/// Compute the renditions for `meta`, lowest first
pub fn compute_ladder(meta: &SourceMetadata) -> Result<Vec<RenditionSpec>, PlanError> {
    let source = SourceVideo::from_metadata(meta)?;
    Ok(ladder_for(&source))
}

pub fn ladder_for(source: &SourceVideo) -> Vec<RenditionSpec> {
    let best = best_match(source.width, source.height);

    QUALITY_LADDER
        .iter()
        .filter(|q| q.height <= best.height)
        .map(|q| {
            let (width, height) = scale_dimensions(source.width, source.height, q);
            RenditionSpec {
                name: q.name.to_string(),
                width,
                height,
                profile: q.profile.to_string(),
                level: q.level.to_string(),
                bitrate: target_bitrate(source, width, height, q),
                fps: target_fps(source.fps, height),
            }
        })
        .collect()
}
