pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod session;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::record::EncoderKind;

pub use crate::error::EngineError;
pub use crate::session::{Session, Status};

/// System configuration
///
/// Layered as defaults, then an optional TOML file, then `VELO__SECTION__KEY`
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub replay: ReplaySettings,
    pub pipeline: PipelineConfig,
    pub network: NetworkConfig,
    pub recording: RecordingConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source spec opened at startup, see [`utils::SourceSpec::parse`]
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Assumed rate until the source advertises or we measure one
    pub fps: f64,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

/// The persisted operator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    pub stream_url: String,
    pub delay_seconds: f64,
    pub replay_seconds: f64,
    pub playback_speed_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sleep after an empty network read
    pub poll_interval_ms: u64,
    pub measure_fps: bool,
    /// Frames per rate measurement
    pub fps_window: usize,
    /// Relative drift before the measured rate is adopted
    pub fps_tolerance: f64,
    pub ingest_core: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub retry_backoff_ms: u64,
    pub stale_after_ms: u64,
    pub join_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub path: PathBuf,
    pub encoder: EncoderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub tick_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "pattern".into(),
            width: 1280,
            height: 720,
            fps: 30.0,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            delay_seconds: 4.0,
            replay_seconds: 10.0,
            playback_speed_factor: 0.5,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            measure_fps: true,
            fps_window: 60,
            fps_tolerance: 0.1,
            ingest_core: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1000,
            stale_after_ms: 3000,
            join_timeout_ms: 1000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("velo_session.y4m"),
            encoder: EncoderKind::Y4m,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        // ~60 Hz
        Self { tick_ms: 15 }
    }
}

impl Config {
    pub const ENV_PREFIX: &'static str = "VELO";

    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
