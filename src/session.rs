//! Operator command surface
//!
//! A [`Session`] ties one delay engine, its replay controller and the
//! recording switch together behind the commands the shell issues, and
//! reports the state the shell shows back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::capture::{Capture, Frame, FrameSource, LocalSource, PatternCapture, SourceHealth};
use crate::display::{Presenter, RenderTick};
use crate::error::{EngineError, SourceError};
use crate::pipeline::{
    BufferFill, Capacities, DelayEngine, IngestReport, Mode, RecorderSetup, ReplayController,
    ReplayToggle, Settings, StatsSnapshot,
};
use crate::record::{encoder_for, EncodeService, RecordingSwitch};
use crate::utils::SourceSpec;
use crate::{Config, ReplaySettings};

/// Turns a parsed source spec into a frame source
pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &SourceSpec, config: &Config) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Pattern sources always, V4L2 devices and stream URLs when built with
/// their backends
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, spec: &SourceSpec, config: &Config) -> Result<Box<dyn FrameSource>, SourceError> {
        let label = spec.to_string();
        match spec {
            SourceSpec::Pattern { width, height } => {
                let (width, height, fps) = (*width, *height, config.capture.fps);
                Ok(Box::new(LocalSource::new(
                    label,
                    Box::new(move || {
                        Ok(Box::new(PatternCapture::new(width, height, fps)) as Box<dyn Capture>)
                    }),
                )))
            }

            #[cfg(feature = "v4l2-capture")]
            SourceSpec::Device(path) => {
                let path = path.to_string_lossy().into_owned();
                let capture = config.capture.clone();
                Ok(Box::new(LocalSource::new(
                    label,
                    Box::new(move || {
                        Ok(Box::new(crate::capture::V4l2Capture::open(&path, &capture)?)
                            as Box<dyn Capture>)
                    }),
                )))
            }
            #[cfg(not(feature = "v4l2-capture"))]
            SourceSpec::Device(_) => Err(SourceError::Unsupported(label)),

            #[cfg(feature = "gstreamer-pipeline")]
            SourceSpec::Url(url) => {
                let url = url.clone();
                Ok(Box::new(crate::capture::NetworkSource::new(
                    label,
                    Box::new(move || {
                        Ok(Box::new(crate::capture::GstCapture::open(&url)?) as Box<dyn Capture>)
                    }),
                    &config.network,
                )))
            }
            #[cfg(not(feature = "gstreamer-pipeline"))]
            SourceSpec::Url(_) => Err(SourceError::Unsupported(label)),
        }
    }
}

/// What the shell shows on each tick
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub mode: Mode,
    pub recording: bool,
    pub source: Option<String>,
    pub ingesting: bool,
    pub health: Option<SourceHealth>,
    /// Delay actually produced, capacity over measured rate
    pub effective_delay: Duration,
    pub effective_replay: Duration,
    pub measured_fps: f64,
    pub playback_speed_factor: f64,
    pub fill: BufferFill,
    pub stats: StatsSnapshot,
}

pub struct Session {
    config: Config,
    opener: Box<dyn SourceOpener>,
    engine: DelayEngine,
    replay: ReplayController,
    recording: RecordingSwitch,
    stream_url: ArcSwap<String>,
}

impl Session {
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let service = encoder_for(config.recording.encoder)?;
        Self::with_encoder(config, service)
    }

    /// Build a session that records through `service` instead of the configured encoder
    pub fn with_encoder(config: Config, service: Arc<dyn EncodeService>) -> Result<Self, EngineError> {
        let settings = Settings::from_replay(&config.replay, config.capture.fps);
        let recording = RecordingSwitch::default();
        let engine = DelayEngine::new(
            settings,
            config.pipeline.clone(),
            RecorderSetup {
                path: config.recording.path.clone(),
                service,
                switch: recording.clone(),
            },
        )?;
        let replay = ReplayController::new(engine.shared().clone());
        let stream_url = ArcSwap::from_pointee(config.replay.stream_url.clone());

        Ok(Self {
            config,
            opener: Box::new(DefaultOpener),
            engine,
            replay,
            recording,
            stream_url,
        })
    }

    pub fn with_opener(mut self, opener: impl SourceOpener + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &DelayEngine {
        &self.engine
    }

    pub fn replay(&self) -> &ReplayController {
        &self.replay
    }

    /// Open `spec` (URL, device index or path, or `pattern[:WxH]`) and start
    /// ingesting from it. On failure the buffers are left as they were.
    #[instrument(skip(self))]
    pub fn start_source(&self, spec: &str) -> Result<(), EngineError> {
        let parsed = SourceSpec::parse(spec)?;
        let source = self.opener.open(&parsed, &self.config)?;
        self.start_with(source)?;
        if let SourceSpec::Url(url) = parsed {
            self.stream_url.store(Arc::new(url));
        }
        Ok(())
    }

    pub fn start_with(&self, source: Box<dyn FrameSource>) -> Result<(), EngineError> {
        self.engine.start(source)
    }

    /// Flip recording and return the new state
    pub fn toggle_recording(&self) -> bool {
        let on = self.recording.toggle();
        info!(on, path = %self.config.recording.path.display(), "recording toggled");
        on
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_on()
    }

    pub fn toggle_replay(&self) -> Result<ReplayToggle, EngineError> {
        self.replay.toggle()
    }

    /// Apply new operator settings at the current measured rate
    pub fn reconfigure(&self, settings: &ReplaySettings) -> Result<Capacities, EngineError> {
        let caps = self
            .engine
            .shared()
            .update(|current| Settings::from_replay(settings, current.measured_fps))?;
        self.stream_url.store(Arc::new(settings.stream_url.clone()));
        Ok(caps)
    }

    /// The settings record the shell persists
    pub fn replay_settings(&self) -> ReplaySettings {
        let current = self.engine.shared().settings();
        ReplaySettings {
            stream_url: String::clone(&self.stream_url.load()),
            delay_seconds: current.delay_seconds,
            replay_seconds: current.replay_seconds,
            playback_speed_factor: current.playback_speed_factor,
        }
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.engine.shared().slot().latest()
    }

    pub fn render_tick<P: Presenter>(&self, presenter: P) -> Result<RenderTick<P>, EngineError> {
        RenderTick::spawn(
            self.engine.shared().clone(),
            Duration::from_millis(self.config.display.tick_ms.max(1)),
            presenter,
        )
    }

    pub fn status(&self) -> Status {
        let shared = self.engine.shared();
        let settings = shared.settings();
        let fill = shared.fill();
        Status {
            mode: shared.slot().mode(),
            recording: self.recording.is_on(),
            source: self.engine.source_label(),
            ingesting: self.engine.is_running(),
            health: self.engine.source_health(),
            effective_delay: settings.span(fill.delay_capacity),
            effective_replay: settings.span(fill.replay_capacity),
            measured_fps: settings.measured_fps,
            playback_speed_factor: settings.playback_speed_factor,
            fill,
            stats: shared.stats(),
        }
    }

    /// Stop replay and ingestion; the recording file is closed when this returns
    pub fn shutdown(&self) -> Option<IngestReport> {
        self.replay.cancel();
        let report = self.engine.stop();
        info!(?report, "session shut down");
        report
    }

    /// Where the session recording is left for export
    pub fn recording_path(&self) -> &Path {
        &self.config.recording.path
    }

    /// Remove the recording file; refused while ingestion may still write it
    pub fn discard_recording(&self) -> Result<bool, EngineError> {
        if self.engine.is_running() {
            return Err(EngineError::StillRunning);
        }
        let path: PathBuf = self.recording_path().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "recording discarded");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(path = %path.display(), "cannot remove recording: {}", e);
                Err(e.into())
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
