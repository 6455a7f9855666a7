//! Fixed-cadence render tick
//!
//! The tick runs on its own thread and only ever reads the latest-frame
//! slot, so a slow or stalled source never holds up presentation.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::capture::Frame;
use crate::error::EngineError;
use crate::pipeline::{EngineShared, Mode};

/// Receives each newly published frame; stands in for the windowing shell
pub trait Presenter: Send + 'static {
    fn present(&mut self, frame: &Frame, mode: Mode);

    /// Called on ticks where nothing new was published
    fn idle(&mut self, _mode: Mode) {}
}

pub struct RenderTick<P: Presenter> {
    stop_tx: Sender<()>,
    handle: JoinHandle<P>,
}

impl<P: Presenter> RenderTick<P> {
    pub fn spawn(
        shared: Arc<EngineShared>,
        cadence: Duration,
        mut presenter: P,
    ) -> Result<Self, EngineError> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("velo-render".into())
            .spawn(move || {
                let mut seen = 0u64;
                let mut next = Instant::now();
                loop {
                    let mode = shared.slot().mode();
                    match shared.slot().latest_since(seen) {
                        Some((version, frame)) => {
                            seen = version;
                            presenter.present(&frame, mode);
                        }
                        None => presenter.idle(mode),
                    }

                    next += cadence;
                    // a late tick is dropped rather than replayed in a burst
                    let now = Instant::now();
                    if next < now {
                        next = now;
                    }
                    match stop_rx.recv_deadline(next) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
                debug!("render tick stopped");
                presenter
            })
            .map_err(|e| EngineError::Spawn {
                name: "render",
                source: e,
            })?;

        info!(?cadence, "render tick started");
        Ok(Self { stop_tx, handle })
    }

    /// Stop ticking and hand the presenter back
    pub fn stop(self) -> Option<P> {
        drop(self.stop_tx);
        match self.handle.join() {
            Ok(presenter) => Some(presenter),
            Err(_) => {
                error!("render tick panicked");
                None
            }
        }
    }
}
