//! Media Transcoder Library
//!
//! This library turns one source video into an HLS VOD package:
//! - Source inspection and adaptive ladder planning
//! - Concurrent encoder invocations with typed progress events
//! - HLS packaging and storyboard sprite generation
//! - Bounded-concurrency upload to S3-compatible storage
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


pub mod command;
pub mod downloader;
pub mod ladder;
pub mod metadata;
pub mod pipeline;
pub mod probe;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod storyboard;
pub mod upload;
pub mod worker;

// Re-export the main entry points for convenience
pub use command::{CommandBuilder, EncodePlan};
pub use ladder::{compute_ladder, PlanError, RenditionSpec};
pub use metadata::SourceMetadata;
pub use pipeline::{JobState, PipelineError, PipelineEvent, TranscodePipeline};
pub use runner::{ProcessRunner, RunEvent};
pub use upload::{UploadManager, UploadSummary};
pub use worker::TranscodeWorker;
