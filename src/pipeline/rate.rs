use std::time::Instant;

use super::ringbuf::RingBuffer;

/// Arrival-rate estimate over a sliding window of frame timestamps
pub struct RateMeter {
    arrivals: RingBuffer<Instant>,
    newest: Option<Instant>,
}

impl RateMeter {
    pub fn new(window: usize) -> Self {
        Self {
            arrivals: RingBuffer::new(window.max(2)),
            newest: None,
        }
    }

    /// Record an arrival; yields frames per second once the window is full
    pub fn observe(&mut self, at: Instant) -> Option<f64> {
        // out-of-order stamps would make the span meaningless
        if self.newest.is_some_and(|newest| at < newest) {
            self.reset();
        }
        self.arrivals.push(at);
        self.newest = Some(at);

        if !self.arrivals.is_full() {
            return None;
        }
        let oldest = *self.arrivals.oldest()?;
        let span = at.duration_since(oldest).as_secs_f64();
        (span > 0.0).then(|| (self.arrivals.len() - 1) as f64 / span)
    }

    pub fn reset(&mut self) {
        self.arrivals.clear();
        self.newest = None;
    }
}
