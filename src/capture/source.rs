//! Frame sources: the contract the ingestion loop pulls from

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::error::SourceError;

use super::frame::Frame;

/// Opaque capture/decode service
///
/// `read` blocks until the next frame is decoded. `None` means the read
/// failed: end-of-stream for a local device, a stutter for a network stream.
pub trait Capture: Send {
    fn read(&mut self) -> Option<Frame>;

    /// Frame rate the device advertises, if it advertises one
    fn nominal_fps(&self) -> Option<f64> {
        None
    }

    fn release(&mut self) {}
}

/// Opens the underlying capture service when a source is opened
pub type Connector = Box<dyn FnMut() -> Result<Box<dyn Capture>, SourceError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    /// An empty read is end-of-stream
    Local,
    /// An empty read means nothing new arrived yet
    Network,
}

/// A single producer of sequential frames
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    fn label(&self) -> &str;

    fn open(&mut self) -> Result<(), SourceError>;

    /// Best-effort read of the most recent frame not yet delivered
    fn read_next(&mut self) -> Option<Frame>;

    fn close(&mut self);

    fn nominal_fps(&self) -> Option<f64> {
        None
    }

    /// Health handle that stays valid after the source moves to the ingestion thread
    fn monitor(&self) -> SourceMonitor {
        SourceMonitor::untracked()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SourceHealth {
    Healthy,
    /// No fresh frame for `stalled_for`
    Stale {
        stalled_for: Duration,
        consecutive_failures: u32,
    },
    /// The background reader terminated while the source was still open
    Lost,
}

/// Shared staleness watchdog for sources with a background reader
#[derive(Clone)]
pub struct SourceMonitor {
    inner: Option<Arc<MonitorState>>,
}

struct MonitorState {
    base: Instant,
    stale_after: Duration,
    last_frame_ns: AtomicU64,
    consecutive_failures: AtomicU32,
    reader_exited: AtomicBool,
    closing: AtomicBool,
}

impl SourceMonitor {
    /// A monitor that always reports healthy, for synchronous sources
    pub fn untracked() -> Self {
        Self { inner: None }
    }

    pub fn tracked(stale_after: Duration) -> Self {
        Self {
            inner: Some(Arc::new(MonitorState {
                base: Instant::now(),
                stale_after,
                last_frame_ns: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                reader_exited: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            })),
        }
    }

    pub fn record_frame(&self) {
        if let Some(state) = &self.inner {
            let now = state.base.elapsed().as_nanos() as u64;
            state.last_frame_ns.store(now, Ordering::Release);
            state.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// Returns the number of consecutive failures including this one
    pub fn record_failure(&self) -> u32 {
        match &self.inner {
            Some(state) => state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        }
    }

    pub fn mark_closing(&self) {
        if let Some(state) = &self.inner {
            state.closing.store(true, Ordering::Release);
        }
    }

    pub fn mark_reader_exited(&self) {
        if let Some(state) = &self.inner {
            state.reader_exited.store(true, Ordering::Release);
        }
    }

    pub fn health(&self) -> SourceHealth {
        let Some(state) = &self.inner else {
            return SourceHealth::Healthy;
        };
        if state.reader_exited.load(Ordering::Acquire) && !state.closing.load(Ordering::Acquire) {
            return SourceHealth::Lost;
        }
        let now = state.base.elapsed();
        let last = Duration::from_nanos(state.last_frame_ns.load(Ordering::Acquire));
        let stalled_for = now.saturating_sub(last);
        if stalled_for >= state.stale_after {
            SourceHealth::Stale {
                stalled_for,
                consecutive_failures: state.consecutive_failures.load(Ordering::Acquire),
            }
        } else {
            SourceHealth::Healthy
        }
    }
}

/// Direct reader for local devices: each read is one blocking capture call
pub struct LocalSource {
    label: String,
    connector: Connector,
    capture: Option<Box<dyn Capture>>,
}

impl LocalSource {
    pub fn new(label: impl Into<String>, connector: Connector) -> Self {
        Self {
            label: label.into(),
            connector,
            capture: None,
        }
    }
}

impl FrameSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.capture.is_none() {
            self.capture = Some((self.connector)()?);
            info!(source = %self.label, "local source opened");
        }
        Ok(())
    }

    fn read_next(&mut self) -> Option<Frame> {
        self.capture.as_mut()?.read()
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
            info!(source = %self.label, "local source closed");
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.capture.as_ref()?.nominal_fps()
    }
}
