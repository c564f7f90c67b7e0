//! Configuration management for the transcoding services
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


use config::{Config, ConfigError, Environment, Map};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Prefix for transcoder settings, e.g. `TRANSCODER_FFMPEG_PATH`
pub const ENV_PREFIX: &str = "TRANSCODER";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: Option<String>,
}

impl ObjectStorageConfig {
    /// Build from `OBJECT_STORAGE_*` lookups; `None` unless every required key is set
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Some(Self {
            endpoint: lookup("OBJECT_STORAGE_ENDPOINT")?,
            access_key: lookup("OBJECT_STORAGE_ACCESS_KEY")?,
            secret_key: lookup("OBJECT_STORAGE_SECRET_KEY")?,
            bucket: lookup("OBJECT_STORAGE_BUCKET")?,
            region: lookup("OBJECT_STORAGE_REGION"),
        })
    }
}

/// Tool paths and pipeline knobs
#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderSettings {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub packager_path: PathBuf,
    /// NVENC multi-part encoding instead of a single libx264 part
    pub gpu: bool,
    /// HLS segment length in seconds
    pub segment_duration: u32,
    /// Parent of the per-job workspaces
    pub work_dir: PathBuf,
    /// Leave the workspace on disk when a job fails
    pub keep_failed_output: bool,
    pub log_level: String,
    /// `console` or `json`
    pub log_format: String,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub transcoder: TranscoderSettings,
    pub object_storage: Option<ObjectStorageConfig>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let transcoder = load_settings(None)?;
        let object_storage = ObjectStorageConfig::from_lookup(|key| env::var(key).ok());

        Ok(Self {
            transcoder,
            object_storage,
        })
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_vars(vars: Map<String, String>) -> Result<Self, SettingsError> {
        let object_storage = ObjectStorageConfig::from_lookup(|key| vars.get(key).cloned());
        let transcoder = load_settings(Some(vars))?;

        Ok(Self {
            transcoder,
            object_storage,
        })
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.transcoder.log_level.is_empty() {
            "info"
        } else {
            &self.transcoder.log_level
        }
    }
}

fn load_settings(source: Option<Map<String, String>>) -> Result<TranscoderSettings, SettingsError> {
    let work_dir = env::temp_dir().join("streamforge");

    let settings: TranscoderSettings = Config::builder()
        .set_default("ffmpeg_path", "ffmpeg")?
        .set_default("ffprobe_path", "ffprobe")?
        .set_default("packager_path", "packager")?
        .set_default("gpu", false)?
        .set_default("segment_duration", 6)?
        .set_default("work_dir", work_dir.to_string_lossy().to_string())?
        .set_default("keep_failed_output", false)?
        .set_default("log_level", "info")?
        .set_default("log_format", "console")?
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(source),
        )
        .build()?
        .try_deserialize()?;

    if settings.segment_duration == 0 {
        return Err(SettingsError::Invalid {
            key: "segment_duration",
            reason: "must be at least 1 second".to_string(),
        });
    }

    Ok(settings)
}
