//! Source metadata as reported by the media-inspection tool
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


use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl CodecType {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("video") => CodecType::Video,
            Some("audio") => CodecType::Audio,
            Some("subtitle") => CodecType::Subtitle,
            _ => CodecType::Other,
        }
    }
}

/// Exact frame rate as a rational, e.g. `24000/1001`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Option<Self> {
        if num == 0 || den == 0 {
            None
        } else {
            Some(Self { num, den })
        }
    }

    /// Parse `num/den` or a plain number; `0/0` and garbage yield `None`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once('/') {
            Some((num, den)) => Self::new(num.trim().parse().ok()?, den.trim().parse().ok()?),
            None => {
                let fps: f64 = value.parse().ok()?;
                if !fps.is_finite() || fps <= 0.0 {
                    return None;
                }
                // keep three decimals of precision for plain values
                Self::new((fps * 1000.0).round() as u32, 1000)
            }
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// One elementary stream of the source container
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: u32,
    pub codec_type: CodecType,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<FrameRate>,
    pub channels: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub bit_rate: Option<u64>,
}

/// Container and stream layout of a source file. Probed once per job.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    pub streams: Vec<StreamInfo>,
    /// Container duration in seconds
    pub duration: Option<f64>,
    /// Container bitrate in bits per second
    pub bit_rate: Option<u64>,
}

impl SourceMetadata {
    /// Parse the JSON document printed by `ffprobe -print_format json -show_format -show_streams`
    pub fn from_probe_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawProbe = serde_json::from_slice(json)?;
        Ok(raw.into())
    }

    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams
            .iter()
            .find(|s| s.codec_type == CodecType::Video)
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams
            .iter()
            .filter(|s| s.codec_type == CodecType::Audio)
    }

    pub fn subtitle_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams
            .iter()
            .filter(|s| s.codec_type == CodecType::Subtitle)
    }

    /// Container duration, falling back to the video stream's own duration
    pub fn duration_secs(&self) -> Option<f64> {
        let usable = |d: &f64| d.is_finite() && *d > 0.0;
        self.duration
            .filter(usable)
            .or_else(|| self.video_stream().and_then(|v| v.duration).filter(usable))
    }

    /// Container bitrate in kbps
    pub fn bitrate_kbps(&self) -> Option<f64> {
        self.bit_rate
            .filter(|b| *b > 0)
            .map(|b| b as f64 / 1000.0)
    }
}

// ffprobe prints most numbers as strings

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    format: Option<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    #[serde(default)]
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

fn tag(tags: &HashMap<String, String>, key: &str) -> Option<String> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(value: &Option<String>) -> Option<T> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

impl From<RawStream> for StreamInfo {
    fn from(raw: RawStream) -> Self {
        let frame_rate = raw
            .avg_frame_rate
            .as_deref()
            .and_then(FrameRate::parse)
            .or_else(|| raw.r_frame_rate.as_deref().and_then(FrameRate::parse));

        StreamInfo {
            index: raw.index,
            codec_type: CodecType::parse(raw.codec_type.as_deref()),
            codec_name: raw.codec_name.clone(),
            width: raw.width.filter(|w| *w > 0),
            height: raw.height.filter(|h| *h > 0),
            frame_rate,
            channels: raw.channels,
            language: tag(&raw.tags, "language"),
            title: tag(&raw.tags, "title"),
            duration: parse_number(&raw.duration),
            bit_rate: parse_number(&raw.bit_rate),
        }
    }
}

impl From<RawProbe> for SourceMetadata {
    fn from(raw: RawProbe) -> Self {
        let (duration, bit_rate) = match &raw.format {
            Some(format) => (parse_number(&format.duration), parse_number(&format.bit_rate)),
            None => (None, None),
        };

        SourceMetadata {
            streams: raw.streams.into_iter().map(StreamInfo::from).collect(),
            duration,
            bit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30000/1001",
                "avg_frame_rate": "30000/1001",
                "duration": "60.060000"
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 6,
                "tags": { "language": "eng", "title": "Surround" }
            },
            {
                "index": 2,
                "codec_name": "subrip",
                "codec_type": "subtitle",
                "tags": { "LANGUAGE": "spa" }
            },
            {
                "index": 3,
                "codec_name": "bin_data",
                "codec_type": "data"
            }
        ],
        "format": {
            "filename": "input.mkv",
            "duration": "60.060000",
            "bit_rate": "5000000"
        }
    }"#;

    #[test]
    fn test_zero_container_duration_falls_back_to_stream() {
        let mut meta = SourceMetadata::from_probe_json(PROBE_JSON.as_bytes()).unwrap();
        meta.duration = Some(0.0);
        assert_eq!(meta.duration_secs(), Some(60.06));

        meta.duration = Some(f64::NAN);
        assert_eq!(meta.duration_secs(), Some(60.06));

        meta.streams[0].duration = Some(0.0);
        assert_eq!(meta.duration_secs(), None);
    }

    #[test]
    fn test_parse_probe_output() {
        let meta = SourceMetadata::from_probe_json(PROBE_JSON.as_bytes()).unwrap();

        assert_eq!(meta.streams.len(), 4);
        assert_eq!(meta.duration, Some(60.06));
        assert_eq!(meta.bitrate_kbps(), Some(5000.0));

        let video = meta.video_stream().unwrap();
        assert_eq!(video.width, Some(1920));
        assert_eq!(video.frame_rate, FrameRate::new(30000, 1001));

        let audio: Vec<_> = meta.audio_streams().collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].channels, Some(6));
        assert_eq!(audio[0].language.as_deref(), Some("eng"));
        assert_eq!(audio[0].title.as_deref(), Some("Surround"));

        let subs: Vec<_> = meta.subtitle_streams().collect();
        assert_eq!(subs[0].codec_name.as_deref(), Some("subrip"));
        assert_eq!(subs[0].language.as_deref(), Some("spa"));
        assert_eq!(meta.streams[3].codec_type, CodecType::Other);
    }

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!(FrameRate::parse("25/1"), FrameRate::new(25, 1));
        assert_eq!(FrameRate::parse("0/0"), None);
        assert_eq!(FrameRate::parse("29.97"), FrameRate::new(29970, 1000));
        assert_eq!(FrameRate::parse("abc"), None);
        assert_eq!(FrameRate::new(24000, 1001).unwrap().to_string(), "24000/1001");
    }

    #[test]
    fn test_avg_frame_rate_falls_back_to_r_frame_rate() {
        let json = r#"{"streams":[{"index":0,"codec_type":"video","width":640,"height":360,
            "avg_frame_rate":"0/0","r_frame_rate":"24/1"}],"format":{}}"#;
        let meta = SourceMetadata::from_probe_json(json.as_bytes()).unwrap();
        assert_eq!(meta.video_stream().unwrap().frame_rate, FrameRate::new(24, 1));
        assert_eq!(meta.bitrate_kbps(), None);
    }

    #[test]
    fn test_duration_falls_back_to_video_stream() {
        let json = r#"{"streams":[{"index":0,"codec_type":"video","duration":"12.5"}],
            "format":{"bit_rate":"800000"}}"#;
        let meta = SourceMetadata::from_probe_json(json.as_bytes()).unwrap();
        assert_eq!(meta.duration_secs(), Some(12.5));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SourceMetadata::from_probe_json(b"not json").is_err());
    }
}
