//! Planning benchmarks
//!
//! Probe JSON parsing, ladder computation and encode plan construction
//! for a few typical source layouts. No external tools are run.
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


use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use media_transcoder::command::CommandBuilder;
use media_transcoder::ladder::compute_ladder;
use media_transcoder::metadata::SourceMetadata;
use std::path::Path;

/// Source layouts: (label, width, height, frame rate, audio channel counts)
const SOURCES: &[(&str, u32, u32, &str, &[u32])] = &[
    ("480p_stereo", 854, 480, "30/1", &[2]),
    ("1080p_surround", 1920, 1080, "24000/1001", &[6, 2]),
    ("1440p_multi", 2560, 1440, "60/1", &[8, 6, 2, 2]),
];

fn probe_json(width: u32, height: u32, fps: &str, audio: &[u32]) -> String {
    let mut streams = vec![format!(
        r#"{{"index":0,"codec_type":"video","codec_name":"h264","width":{},"height":{},"avg_frame_rate":"{}"}}"#,
        width, height, fps
    )];
    for (i, channels) in audio.iter().enumerate() {
        streams.push(format!(
            r#"{{"index":{},"codec_type":"audio","codec_name":"aac","channels":{},"tags":{{"language":"eng"}}}}"#,
            i + 1,
            channels
        ));
    }
    streams.push(format!(
        r#"{{"index":{},"codec_type":"subtitle","codec_name":"subrip","tags":{{"language":"eng"}}}}"#,
        audio.len() + 1
    ));
    format!(
        r#"{{"streams":[{}],"format":{{"duration":"5400.0","bit_rate":"12000000"}}}}"#,
        streams.join(",")
    )
}

fn benchmark_probe_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_parsing");
    for (label, width, height, fps, audio) in SOURCES {
        let json = probe_json(*width, *height, fps, audio);
        group.bench_with_input(BenchmarkId::from_parameter(label), &json, |b, json| {
            b.iter(|| SourceMetadata::from_probe_json(black_box(json.as_bytes())))
        });
    }
    group.finish();
}

fn benchmark_ladder(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_ladder");
    for (label, width, height, fps, audio) in SOURCES {
        let Ok(meta) = SourceMetadata::from_probe_json(probe_json(*width, *height, fps, audio).as_bytes()) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(label), &meta, |b, meta| {
            b.iter(|| compute_ladder(black_box(meta)))
        });
    }
    group.finish();
}

fn benchmark_encode_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_plan");
    for gpu in [false, true] {
        let builder = CommandBuilder::new(gpu, 6);
        for (label, width, height, fps, audio) in SOURCES {
            let Ok(meta) = SourceMetadata::from_probe_json(probe_json(*width, *height, fps, audio).as_bytes()) else {
                continue;
            };
            let id = format!("{}_{}", if gpu { "nvenc" } else { "x264" }, label);
            group.bench_with_input(BenchmarkId::from_parameter(id), &meta, |b, meta| {
                b.iter(|| {
                    builder.build(
                        black_box(Path::new("/data/in/source.mkv")),
                        black_box(Path::new("/data/out")),
                        black_box(meta),
                    )
                })
            });
        }
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(50)
        .warm_up_time(std::time::Duration::from_secs(1))
        .measurement_time(std::time::Duration::from_secs(3));
    targets = benchmark_probe_parsing, benchmark_ladder, benchmark_encode_plan
}
criterion_main!(benches);
