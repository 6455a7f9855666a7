//! Slow-motion replay of the replay buffer
//!
//! A toggle either starts a run over a snapshot of the replay buffer or
//! cancels the run in progress. At most one run exists at a time; while it
//! owns the latest-frame slot, ingestion keeps buffering but does not display.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::capture::Frame;
use crate::error::EngineError;

use super::engine::EngineShared;
use super::overlay;
use super::slot::{Mode, ReplayTicket, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplayToggle {
    Started {
        frames: usize,
        frame_interval: Duration,
    },
    Cancelled,
    NothingToReplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub shown: usize,
    pub total: usize,
    pub completed: bool,
}

struct Run {
    ticket: ReplayTicket,
    // dropping the sender wakes the run out of its pacing wait
    cancel: Sender<()>,
    handle: JoinHandle<ReplayOutcome>,
}

impl Run {
    fn finish(self) -> Option<ReplayOutcome> {
        drop(self.cancel);
        match self.handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!(ticket = ?self.ticket, "replay thread panicked");
                None
            }
        }
    }
}

pub struct ReplayController {
    shared: Arc<EngineShared>,
    active: Mutex<Option<Run>>,
}

impl ReplayController {
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<Run>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> Mode {
        self.shared.slot().mode()
    }

    /// Start a replay, or cancel the one in progress
    pub fn toggle(&self) -> Result<ReplayToggle, EngineError> {
        let mut active = self.active();

        if self.shared.slot().cancel_replay() {
            if let Some(run) = active.take() {
                let outcome = run.finish();
                info!(?outcome, "replay cancelled");
            }
            return Ok(ReplayToggle::Cancelled);
        }

        // reap a run that already finished on its own
        if let Some(run) = active.take() {
            run.finish();
        }

        let snapshot = self.shared.replay_snapshot();
        if snapshot.frames.is_empty() {
            info!("nothing to replay");
            return Ok(ReplayToggle::NothingToReplay);
        }

        let Some(ticket) = self.shared.slot().enter_replay() else {
            // cannot happen while we hold `active`, treat as a cancel
            return Ok(ReplayToggle::Cancelled);
        };

        let frames = snapshot.frames.len();
        let frame_interval = snapshot.settings.frame_interval();
        let (cancel, cancel_rx) = flume::bounded(1);
        let shared = self.shared.clone();

        let spawned = thread::Builder::new()
            .name("velo-replay".into())
            .spawn(move || play(shared, ticket, snapshot.frames, frame_interval, cancel_rx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.slot().leave_replay(ticket);
                return Err(EngineError::Spawn {
                    name: "replay",
                    source: e,
                });
            }
        };

        metrics::counter!("velo_replay_runs_total").increment(1);
        info!(frames, ?frame_interval, "replay started");
        *active = Some(Run {
            ticket,
            cancel,
            handle,
        });
        Ok(ReplayToggle::Started {
            frames,
            frame_interval,
        })
    }

    /// Cancel a running replay; returns whether one was running
    pub fn cancel(&self) -> bool {
        let mut active = self.active();
        let was_replaying = self.shared.slot().cancel_replay();
        if let Some(run) = active.take() {
            run.finish();
        }
        was_replaying
    }

    /// Block until the current run ends by itself
    pub fn wait(&self) -> Option<ReplayOutcome> {
        let run = self.active().take()?;
        // without dropping the sender first, so the run plays out
        match run.handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!(ticket = ?run.ticket, "replay thread panicked");
                None
            }
        }
    }
}

impl Drop for ReplayController {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Hands the slot back to ingestion however the run ends
struct SlotRelease {
    shared: Arc<EngineShared>,
    ticket: ReplayTicket,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.shared.slot().leave_replay(self.ticket);
    }
}

fn play(
    shared: Arc<EngineShared>,
    ticket: ReplayTicket,
    frames: Vec<Frame>,
    interval: Duration,
    cancel: Receiver<()>,
) -> ReplayOutcome {
    let release = SlotRelease {
        shared: shared.clone(),
        ticket,
    };
    let total = frames.len();
    let mut shown = 0;
    let mut deadline = Instant::now();

    for (position, frame) in frames.iter().enumerate() {
        match cancel.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        let annotated = overlay::annotate_replay(frame, position, total).unwrap_or_else(|e| {
            debug!(sequence = frame.sequence(), "replay overlay skipped: {}", e);
            frame.clone()
        });
        if !shared.slot().publish(Writer::Replay(ticket), annotated) {
            break;
        }
        shown += 1;

        deadline += interval;
        match cancel.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    drop(release);
    let outcome = ReplayOutcome {
        shown,
        total,
        completed: shown == total,
    };
    debug!(?outcome, "replay run ended");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pipeline::settings::Settings;

    fn shared(speed: f64) -> Arc<EngineShared> {
        Arc::new(
            EngineShared::new(Settings {
                delay_seconds: 1.0,
                replay_seconds: 1.0,
                playback_speed_factor: speed,
                measured_fps: 100.0,
            })
            .unwrap(),
        )
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![10u8; 4 * 4 * 3], seq, 4, 4, PixelFormat::Rgb24)
    }

    #[test]
    fn empty_buffer_is_a_no_op() {
        let controller = ReplayController::new(shared(1.0));
        assert_eq!(controller.toggle().unwrap(), ReplayToggle::NothingToReplay);
        assert_eq!(controller.mode(), Mode::Live);
    }

    #[test]
    fn plays_whole_snapshot_then_returns_live() {
        let shared = shared(1.0);
        for seq in 1..=5 {
            shared.admit(frame(seq));
        }
        let controller = ReplayController::new(shared.clone());

        match controller.toggle().unwrap() {
            ReplayToggle::Started {
                frames,
                frame_interval,
            } => {
                assert_eq!(frames, 5);
                assert_eq!(frame_interval, Duration::from_millis(10));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(controller.mode(), Mode::Replaying);

        let outcome = controller.wait().unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.shown, 5);
        assert_eq!(controller.mode(), Mode::Live);

        // last replayed frame stays until ingestion writes again
        let last = shared.slot().latest().unwrap();
        assert_eq!(last.sequence(), 5);
        assert_ne!(last.data, frame(5).data, "replayed frames carry the overlay");
    }

    #[test]
    fn second_toggle_cancels() {
        let shared = shared(0.01);
        for seq in 1..=50 {
            shared.admit(frame(seq));
        }
        let controller = ReplayController::new(shared.clone());

        assert!(matches!(controller.toggle().unwrap(), ReplayToggle::Started { .. }));
        assert_eq!(controller.toggle().unwrap(), ReplayToggle::Cancelled);
        assert_eq!(controller.mode(), Mode::Live);
        assert!(shared.admit(frame(51)), "ingestion owns the slot again");
    }

    #[test]
    fn snapshot_ignores_later_pushes() {
        let shared = shared(1.0);
        for seq in 1..=3 {
            shared.admit(frame(seq));
        }
        let controller = ReplayController::new(shared.clone());
        controller.toggle().unwrap();
        for seq in 4..=10 {
            shared.admit(frame(seq));
        }
        let outcome = controller.wait().unwrap();
        assert_eq!(outcome.total, 3);
    }
}
