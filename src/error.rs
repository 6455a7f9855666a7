//! Error types shared across the capture, pipeline and recording layers

use std::io;

use thiserror::Error;

use crate::capture::PixelFormat;

/// Failures opening or talking to a frame source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {spec:?} unavailable: {reason}")]
    Unavailable { spec: String, reason: String },

    #[error("source {0:?} needs a capture backend this build does not include")]
    Unsupported(String),

    #[error("source already closed")]
    Closed,
}

impl SourceError {
    pub fn unavailable(spec: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            spec: spec.into(),
            reason: reason.to_string(),
        }
    }
}

/// Rejected runtime settings; the previous settings stay in effect
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("playback speed factor must be in (0, 1], got {0}")]
    SpeedOutOfRange(f64),

    #[error("{field} needs {frames} frames, more than the {max} a buffer may hold")]
    TooLarge {
        field: &'static str,
        frames: f64,
        max: usize,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(String),

    #[error("{format:?} payload is {actual} bytes, expected {expected} for {width}x{height}")]
    Size {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording file i/o: {0}")]
    Io(#[from] io::Error),

    #[error("frame is {got_width}x{got_height}, recording was opened at {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("encoder: {0}")]
    Encoder(String),
}

/// Errors surfaced through the operator command surface
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("ingestion is still running")]
    StillRunning,

    #[error(transparent)]
    Io(#[from] io::Error),
}
