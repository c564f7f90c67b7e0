//! Encoder and packager command construction
//!
//! Turns probed metadata and a rendition ladder into an `EncodePlan`: the
//! argument vector of every encoder invocation ("part"), the packager
//! argument vector, and the manifest of every file the plan produces.
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


use std::path::Path;
use streamforge_types::{AudioAsset, Manifest, SubtitleAsset, VideoAsset};

use crate::ladder::{compute_ladder, PlanError, RenditionSpec, SourceVideo};
use crate::metadata::{SourceMetadata, StreamInfo};

/// NVENC session limit per encoder invocation
pub const GPU_OUTPUTS_PER_PART: usize = 3;
pub const TS_OFFSET_MS: u32 = 10_000;
pub const STEREO_BITRATE: u32 = 160;
pub const SURROUND_51_BITRATE: u32 = 320;
pub const SURROUND_71_BITRATE: u32 = 384;
pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// 5.1 to stereo, by channel index so `5.1` and `5.1(side)` both work
const DOWNMIX_51: &str = "pan=stereo|c0=c0+0.5*c2+0.5*c3+0.707*c4|c1=c1+0.5*c2+0.5*c3+0.707*c5";
const DOWNMIX_71: &str =
    "pan=stereo|c0=c0+0.5*c2+0.5*c3+0.707*c4+0.707*c6|c1=c1+0.5*c2+0.5*c3+0.707*c5+0.707*c7";

/// Video encoder selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    /// libx264, one part for the whole ladder
    Software,
    /// h264_nvenc, at most three outputs per part
    Nvenc,
}

impl VideoEncoder {
    pub fn from_gpu(gpu: bool) -> Self {
        if gpu {
            VideoEncoder::Nvenc
        } else {
            VideoEncoder::Software
        }
    }

    fn codec(&self) -> &'static str {
        match self {
            VideoEncoder::Software => "libx264",
            VideoEncoder::Nvenc => "h264_nvenc",
        }
    }

    fn preset(&self) -> &'static str {
        match self {
            VideoEncoder::Software => "medium",
            VideoEncoder::Nvenc => "p4",
        }
    }

    /// Keep keyframes on the GOP grid and B-frames out of the reference chain
    fn gop_args(&self) -> [&'static str; 4] {
        match self {
            VideoEncoder::Software => ["-sc_threshold", "0", "-b-pyramid", "none"],
            VideoEncoder::Nvenc => ["-no-scenecut", "1", "-b_ref_mode", "disabled"],
        }
    }

    fn outputs_per_part(&self, renditions: usize) -> usize {
        match self {
            VideoEncoder::Software => renditions.max(1),
            VideoEncoder::Nvenc => GPU_OUTPUTS_PER_PART,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    /// Video renditions sharing one `split` filter graph
    Video,
    /// All audio and subtitle outputs
    Media,
}

/// One encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePart {
    pub index: usize,
    pub kind: PartKind,
    pub args: Vec<String>,
}

/// Everything needed to run one job. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub renditions: Vec<RenditionSpec>,
    pub parts: Vec<EncodePart>,
    pub packager_args: Vec<String>,
    /// Absolute, forward-slash paths; part and packager arguments keep host paths
    pub manifest: Manifest,
    pub master_playlist: String,
    /// Forward-slash output root the manifest is relative to
    pub output_dir: String,
    pub gop: u32,
}

impl EncodePlan {
    pub fn video_parts(&self) -> impl Iterator<Item = &EncodePart> {
        self.parts.iter().filter(|p| p.kind == PartKind::Video)
    }
}

/// Builds encode plans
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    encoder: VideoEncoder,
    segment_duration: u32,
}

impl CommandBuilder {
    pub fn new(gpu: bool, segment_duration: u32) -> Self {
        Self {
            encoder: VideoEncoder::from_gpu(gpu),
            segment_duration: segment_duration.max(1),
        }
    }

    pub fn encoder(&self) -> VideoEncoder {
        self.encoder
    }

    /// Plan with the ladder computed from `meta`
    pub fn build(
        &self,
        input: &Path,
        output_dir: &Path,
        meta: &SourceMetadata,
    ) -> Result<EncodePlan, PlanError> {
        let ladder = compute_ladder(meta)?;
        self.build_with_ladder(input, output_dir, meta, ladder)
    }

    pub fn build_with_ladder(
        &self,
        input: &Path,
        output_dir: &Path,
        meta: &SourceMetadata,
        renditions: Vec<RenditionSpec>,
    ) -> Result<EncodePlan, PlanError> {
        let source = SourceVideo::from_metadata(meta)?;
        if renditions.is_empty() {
            return Err(PlanError::InvalidSource("empty rendition ladder".to_string()));
        }

        let input = host_path(input);
        let out = to_slash(output_dir).trim_end_matches('/').to_string();
        let gop = source.gop();

        let mut parts = Vec::new();
        let mut manifest = Manifest::default();

        // video parts, deterministic chunks in rendition order
        let chunk_size = self.encoder.outputs_per_part(renditions.len());
        let mut rendition_index = 0;
        for chunk in renditions.chunks(chunk_size) {
            let part = parts.len();
            let mut args = input_args(&input);
            args.push("-filter_complex".to_string());
            args.push(filter_graph(chunk, rendition_index));

            for rendition in chunk {
                let file = format!("video_{}.mp4", rendition_index);
                let target = host_path(&output_dir.join(&file));
                args.extend(self.video_output_args(rendition, rendition_index, gop, &target));
                manifest.video.push(VideoAsset {
                    index: rendition_index,
                    part,
                    fps: round_fps(rendition.fps.as_f64()),
                    output: format!("{}/{}", out, file),
                    bitrate: rendition.bitrate,
                    name: rendition.name.clone(),
                    width: rendition.width,
                    profile: rendition.profile.clone(),
                    height: rendition.height,
                    level: rendition.level.clone(),
                    playlist: Some(format!("{}/video_{}.m3u8", out, rendition_index)),
                });
                rendition_index += 1;
            }

            parts.push(EncodePart {
                index: part,
                kind: PartKind::Video,
                args,
            });
        }

        // trailing part for audio and subtitles
        let media_part = parts.len();
        let mut media_args = Vec::new();
        for (track, stream) in meta.audio_streams().enumerate() {
            let outputs =
                plan_audio_track(stream, track, media_part, output_dir, &out, &mut manifest.audio);
            media_args.extend(outputs);
        }
        for (track, stream) in meta.subtitle_streams().enumerate() {
            let outputs = plan_subtitle_track(
                stream,
                track,
                media_part,
                output_dir,
                &out,
                &mut manifest.subtitle,
            );
            media_args.extend(outputs);
        }
        if !media_args.is_empty() {
            let mut args = input_args(&input);
            args.extend(media_args);
            parts.push(EncodePart {
                index: media_part,
                kind: PartKind::Media,
                args,
            });
        }

        let master_playlist = format!("{}/{}", out, MASTER_PLAYLIST);
        let packager_args = packager_args(&manifest, output_dir, self.segment_duration);

        Ok(EncodePlan {
            renditions,
            parts,
            packager_args,
            manifest,
            master_playlist,
            output_dir: out,
            gop,
        })
    }

    fn video_output_args(
        &self,
        rendition: &RenditionSpec,
        index: usize,
        gop: u32,
        output: &str,
    ) -> Vec<String> {
        let bitrate = format!("{}k", rendition.bitrate);
        let gop = gop.to_string();

        let mut args: Vec<String> = vec![
            "-map".into(),
            format!("[v{}]", index),
            "-c:v".into(),
            self.encoder.codec().into(),
            "-profile:v".into(),
            rendition.profile.clone(),
            "-level:v".into(),
            rendition.level.clone(),
            "-preset".into(),
            self.encoder.preset().into(),
            "-g".into(),
            gop.clone(),
            "-keyint_min".into(),
            gop,
        ];
        args.extend(self.encoder.gop_args().iter().map(|a| a.to_string()));
        args.extend([
            "-b:v".to_string(),
            bitrate.clone(),
            "-minrate".to_string(),
            bitrate.clone(),
            "-maxrate".to_string(),
            bitrate.clone(),
            "-bufsize".to_string(),
            bitrate,
            "-movflags".to_string(),
            "+faststart+negative_cts_offsets".to_string(),
            "-video_track_timescale".to_string(),
            "90000".to_string(),
            output.to_string(),
        ]);
        args
    }
}

fn input_args(input: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string(),
    ]
}

/// `[0:v:0]split=N[s0]..;[s0]scale=W:H,fps=F[v<i>];..`
fn filter_graph(chunk: &[RenditionSpec], first_index: usize) -> String {
    let mut graph = format!("[0:v:0]split={}", chunk.len());
    for local in 0..chunk.len() {
        graph.push_str(&format!("[s{}]", local));
    }
    for (local, rendition) in chunk.iter().enumerate() {
        graph.push_str(&format!(
            ";[s{}]scale={}:{},fps={}[v{}]",
            local,
            rendition.width,
            rendition.height,
            rendition.fps,
            first_index + local
        ));
    }
    graph
}

fn round_fps(fps: f64) -> f64 {
    (fps * 1000.0).round() / 1000.0
}

fn language_of(stream: &StreamInfo) -> String {
    stream.language.clone().unwrap_or_else(|| "und".to_string())
}

fn title_of(stream: &StreamInfo, track: usize) -> String {
    stream
        .title
        .clone()
        .unwrap_or_else(|| format!("Track_{}", track + 1))
}

/// How one source audio track is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioLayout {
    /// Mono or stereo, encoded once at 160k
    Stereo,
    /// 5.1 or 7.1: full-layout archival copy plus a pan-matrix downmix
    Surround { bitrate: u32, downmix: &'static str },
    /// Any other layout: untouched copy plus a forced `-ac 2` downmix
    Other,
}

impl AudioLayout {
    fn for_channels(channels: u32) -> Self {
        match channels {
            0..=2 => AudioLayout::Stereo,
            6 => AudioLayout::Surround {
                bitrate: SURROUND_51_BITRATE,
                downmix: DOWNMIX_51,
            },
            8 => AudioLayout::Surround {
                bitrate: SURROUND_71_BITRATE,
                downmix: DOWNMIX_71,
            },
            _ => AudioLayout::Other,
        }
    }
}

struct AudioOutput {
    channels: u32,
    bitrate: Option<u32>,
    filter: Option<(&'static str, &'static str)>,
    packaged: bool,
}

fn plan_audio_track(
    stream: &StreamInfo,
    track: usize,
    part: usize,
    output_dir: &Path,
    out: &str,
    assets: &mut Vec<AudioAsset>,
) -> Vec<String> {
    // missing channel count is treated as stereo
    let channels = stream.channels.unwrap_or(2);

    let outputs = match AudioLayout::for_channels(channels) {
        AudioLayout::Stereo => vec![AudioOutput {
            channels,
            bitrate: Some(STEREO_BITRATE),
            filter: None,
            packaged: true,
        }],
        AudioLayout::Surround { bitrate, downmix } => vec![
            AudioOutput {
                channels,
                bitrate: Some(bitrate),
                filter: None,
                packaged: false,
            },
            AudioOutput {
                channels: 2,
                bitrate: Some(STEREO_BITRATE),
                filter: Some(("-af", downmix)),
                packaged: true,
            },
        ],
        AudioLayout::Other => vec![
            AudioOutput {
                channels,
                bitrate: None,
                filter: None,
                packaged: false,
            },
            AudioOutput {
                channels: 2,
                bitrate: Some(STEREO_BITRATE),
                filter: Some(("-ac", "2")),
                packaged: true,
            },
        ],
    };

    let language = language_of(stream);
    let title = title_of(stream, track);
    let mut args = Vec::new();

    for output in outputs {
        let index = assets.len();
        let file = format!("audio_{}.mp4", index);

        args.push("-map".to_string());
        args.push(format!("0:a:{}", track));
        if let Some((flag, value)) = output.filter {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        if let Some(bitrate) = output.bitrate {
            args.push("-b:a".to_string());
            args.push(format!("{}k", bitrate));
        }
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push(host_path(&output_dir.join(&file)));

        assets.push(AudioAsset {
            index,
            part,
            default: track == 0,
            output: format!("{}/{}", out, file),
            channels: output.channels,
            bitrate: output.bitrate,
            language: language.clone(),
            title: title.clone(),
            codec: "aac".to_string(),
            packaged: output.packaged,
            playlist: output
                .packaged
                .then(|| format!("{}/audio_{}.m3u8", out, index)),
        });
    }

    args
}

/// Output codec and file extension for a source subtitle codec
pub fn subtitle_codec(codec_name: Option<&str>) -> (&'static str, &'static str) {
    match codec_name.map(|c| c.to_ascii_lowercase()).as_deref() {
        Some("ass") | Some("ssa") => ("ass", "ass"),
        // subrip, webvtt and anything unknown
        _ => ("webvtt", "vtt"),
    }
}

fn plan_subtitle_track(
    stream: &StreamInfo,
    track: usize,
    part: usize,
    output_dir: &Path,
    out: &str,
    assets: &mut Vec<SubtitleAsset>,
) -> Vec<String> {
    let (codec, ext) = subtitle_codec(stream.codec_name.as_deref());
    let index = assets.len();
    let file = format!("subtitle_{}.{}", index, ext);

    assets.push(SubtitleAsset {
        index,
        part,
        default: track == 0,
        output: format!("{}/{}", out, file),
        language: language_of(stream),
        title: title_of(stream, track),
        codec: codec.to_string(),
        playlist: Some(format!("{}/subtitle_{}.m3u8", out, index)),
    });

    vec![
        "-map".to_string(),
        format!("0:s:{}", track),
        "-c:s".to_string(),
        codec.to_string(),
        host_path(&output_dir.join(file)),
    ]
}

/// Stream descriptors use `,` and `=` as separators
fn descriptor_value(value: &str) -> String {
    value.replace([',', '='], " ")
}

fn packager_args(manifest: &Manifest, output_dir: &Path, segment_duration: u32) -> Vec<String> {
    let host = |name: String| host_path(&output_dir.join(name));
    let mut args = vec![
        "--transport_stream_timestamp_offset_ms".to_string(),
        TS_OFFSET_MS.to_string(),
        "--segment_duration".to_string(),
        segment_duration.to_string(),
        "--clear_lead".to_string(),
        "0".to_string(),
    ];

    for video in &manifest.video {
        args.push(format!(
            "in={},stream=video,segment_template={},playlist_name=video_{}.m3u8",
            host(format!("video_{}.mp4", video.index)),
            host(format!("video_{}/seg_$Number$.ts", video.index)),
            video.index
        ));
    }

    for audio in manifest.packaged_audio() {
        args.push(format!(
            "in={},stream=audio,segment_template={},playlist_name=audio_{}.m3u8,hls_group_id=audio,hls_name={},language={}",
            host(format!("audio_{}.mp4", audio.index)),
            host(format!("audio_{}/seg_$Number$.ts", audio.index)),
            audio.index,
            descriptor_value(&audio.title),
            descriptor_value(&audio.language)
        ));
    }

    for subtitle in &manifest.subtitle {
        let ext = if subtitle.codec == "ass" { "ass" } else { "vtt" };
        args.push(format!(
            "in={},stream=text,segment_template={},playlist_name=subtitle_{}.m3u8,hls_group_id=subtitles,hls_name={},language={}",
            host(format!("subtitle_{}.{}", subtitle.index, ext)),
            host(format!("subtitle_{}/seg_$Number$.{}", subtitle.index, ext)),
            subtitle.index,
            descriptor_value(&subtitle.title),
            descriptor_value(&subtitle.language)
        ));
    }

    args.push("--hls_master_playlist_output".to_string());
    args.push(host(MASTER_PLAYLIST.to_string()));
    args
}

/// Path as handed to a subprocess, separators untouched
pub fn host_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Forward-slash form used in the manifest and job results
pub fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
