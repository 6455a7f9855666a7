//! The single frame handed to the render tick, and who may write it
//!
//! Ingestion writes while the mode is `Live`; exactly one replay run writes
//! while it is `Replaying`. Every write goes through [`LatestFrameSlot::publish`],
//! which checks the writer against the mode under the same lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::capture::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Live,
    Replaying,
}

/// Identifies one replay run; stale tickets are refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Ingest,
    Replay(ReplayTicket),
}

pub struct LatestFrameSlot {
    inner: Mutex<Inner>,
}

struct Inner {
    mode: Mode,
    ticket: u64,
    version: u64,
    frame: Option<Frame>,
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Live,
                ticket: 0,
                version: 0,
                frame: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame` if `writer` owns the slot in the current mode
    pub fn publish(&self, writer: Writer, frame: Frame) -> bool {
        let mut inner = self.lock();
        let allowed = match (writer, inner.mode) {
            (Writer::Ingest, Mode::Live) => true,
            (Writer::Replay(ReplayTicket(t)), Mode::Replaying) => t == inner.ticket,
            _ => false,
        };
        if allowed {
            inner.frame = Some(frame);
            inner.version += 1;
        }
        allowed
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// The current frame if it changed since `seen`, with its version
    pub fn latest_since(&self, seen: u64) -> Option<(u64, Frame)> {
        let inner = self.lock();
        if inner.version == seen {
            return None;
        }
        inner.frame.clone().map(|frame| (inner.version, frame))
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Switch to `Replaying` and hand out the ticket that may write, or `None`
    /// if a replay already owns the slot
    pub fn enter_replay(&self) -> Option<ReplayTicket> {
        let mut inner = self.lock();
        if inner.mode == Mode::Replaying {
            return None;
        }
        inner.mode = Mode::Replaying;
        inner.ticket += 1;
        Some(ReplayTicket(inner.ticket))
    }

    /// Return to `Live` if `ticket` is still the active run
    pub fn leave_replay(&self, ticket: ReplayTicket) -> bool {
        let mut inner = self.lock();
        if inner.mode == Mode::Replaying && inner.ticket == ticket.0 {
            inner.mode = Mode::Live;
            true
        } else {
            false
        }
    }

    /// Return to `Live` whichever run is active
    pub fn cancel_replay(&self) -> bool {
        let mut inner = self.lock();
        let was_replaying = inner.mode == Mode::Replaying;
        inner.mode = Mode::Live;
        was_replaying
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 3], seq, 1, 1, PixelFormat::Rgb24)
    }

    #[test]
    fn ingest_writes_only_while_live() {
        let slot = LatestFrameSlot::new();
        assert!(slot.publish(Writer::Ingest, frame(1)));

        let ticket = slot.enter_replay().unwrap();
        assert!(!slot.publish(Writer::Ingest, frame(2)));
        assert!(slot.publish(Writer::Replay(ticket), frame(3)));
        assert_eq!(slot.latest().map(|f| f.sequence()), Some(3));

        assert!(slot.leave_replay(ticket));
        assert!(!slot.publish(Writer::Replay(ticket), frame(4)));
        assert!(slot.publish(Writer::Ingest, frame(5)));
    }

    #[test]
    fn cancelled_ticket_cannot_write_again() {
        let slot = LatestFrameSlot::new();
        let first = slot.enter_replay().unwrap();
        assert!(slot.enter_replay().is_none());
        assert!(slot.cancel_replay());
        assert_eq!(slot.mode(), Mode::Live);

        let second = slot.enter_replay().unwrap();
        assert_ne!(first, second);
        assert!(!slot.publish(Writer::Replay(first), frame(1)));
        assert!(!slot.leave_replay(first));
        assert_eq!(slot.mode(), Mode::Replaying);
    }

    #[test]
    fn leaving_replay_keeps_last_frame() {
        let slot = LatestFrameSlot::new();
        let ticket = slot.enter_replay().unwrap();
        slot.publish(Writer::Replay(ticket), frame(9));
        slot.leave_replay(ticket);
        assert_eq!(slot.latest().map(|f| f.sequence()), Some(9));
    }

    #[test]
    fn latest_since_reports_changes_only() {
        let slot = LatestFrameSlot::new();
        assert!(slot.latest_since(0).is_none());
        slot.publish(Writer::Ingest, frame(1));
        let (version, seen) = slot.latest_since(0).unwrap();
        assert_eq!(seen.sequence(), 1);
        assert!(slot.latest_since(version).is_none());
    }
}
