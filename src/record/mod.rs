//! Best-effort recording of raw, undelayed frames to the session file

pub mod y4m;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_encoder;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::capture::Frame;
use crate::error::RecorderError;

pub use y4m::Y4mEncoder;

/// An open recording handle
pub trait VideoWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError>;

    /// Flush and close the file
    fn finish(self: Box<Self>) -> Result<(), RecorderError>;
}

/// External encode service: opens a writer for a file at a given geometry
pub trait EncodeService: Send + Sync {
    fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoWriter>, RecorderError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Uncompressed YUV4MPEG2
    Y4m,
    /// H.264 in MP4 through GStreamer
    Gstreamer,
}

pub fn encoder_for(kind: EncoderKind) -> Result<Arc<dyn EncodeService>, RecorderError> {
    match kind {
        EncoderKind::Y4m => Ok(Arc::new(Y4mEncoder)),
        #[cfg(feature = "gstreamer-pipeline")]
        EncoderKind::Gstreamer => Ok(Arc::new(gst_encoder::GstEncoder)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        EncoderKind::Gstreamer => Err(RecorderError::Encoder(
            "built without the gstreamer-pipeline feature".into(),
        )),
    }
}

/// Operator-controlled recording flag, shared with the ingestion thread
#[derive(Debug, Clone, Default)]
pub struct RecordingSwitch(Arc<AtomicBool>);

impl RecordingSwitch {
    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Release);
    }

    /// Flip the flag and return the new state
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::AcqRel)
    }
}

/// Sink owned by the ingestion loop for the duration of one session
pub struct Recorder {
    path: PathBuf,
    service: Arc<dyn EncodeService>,
    switch: RecordingSwitch,
    writer: Option<Box<dyn VideoWriter>>,
    opened: bool,
    written: u64,
}

impl Recorder {
    pub fn new(path: PathBuf, service: Arc<dyn EncodeService>, switch: RecordingSwitch) -> Self {
        Self {
            path,
            service,
            switch,
            writer: None,
            opened: false,
            written: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Recreate the session file, sized after the first frame of the session
    pub fn open(&mut self, first: &Frame, fps: f64) {
        self.opened = true;
        match self
            .service
            .open(&self.path, fps, first.width(), first.height())
        {
            Ok(writer) => {
                info!(
                    path = %self.path.display(),
                    encoder = self.service.name(),
                    width = first.width(),
                    height = first.height(),
                    fps,
                    "recording file opened"
                );
                self.writer = Some(writer);
            }
            Err(e) => {
                error!(path = %self.path.display(), "cannot open recording file: {}", e);
                self.disable();
            }
        }
    }

    /// Append `frame` if recording is on; returns whether it was written
    pub fn record(&mut self, frame: &Frame) -> bool {
        if !self.switch.is_on() {
            return false;
        }
        let Some(writer) = self.writer.as_mut() else {
            warn!("recording requested but no recording file is open");
            self.disable();
            return false;
        };
        match writer.write(frame) {
            Ok(()) => {
                self.written += 1;
                metrics::counter!("velo_frames_recorded_total").increment(1);
                true
            }
            Err(e) => {
                error!(sequence = frame.sequence(), "recording write failed: {}", e);
                metrics::counter!("velo_recorder_failures_total").increment(1);
                self.disable();
                false
            }
        }
    }

    /// Flush and close; safe to call more than once
    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finish() {
                Ok(()) => info!(
                    path = %self.path.display(),
                    frames = self.written,
                    "recording file closed"
                ),
                Err(e) => error!(path = %self.path.display(), "closing recording failed: {}", e),
            }
        }
    }

    fn disable(&self) {
        if self.switch.is_on() {
            warn!("recording switched off");
        }
        self.switch.set(false);
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.finish();
    }
}
