//! Synthetic moving test pattern, paced like a real device

use std::thread;
use std::time::{Duration, Instant};

use super::frame::{Frame, PixelFormat};
use super::source::Capture;

pub struct PatternCapture {
    width: u32,
    height: u32,
    fps: f64,
    sequence: u64,
    limit: Option<u64>,
    next_due: Option<Instant>,
    paced: bool,
}

impl PatternCapture {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            fps: if fps > 0.0 { fps } else { 30.0 },
            sequence: 0,
            limit: None,
            next_due: None,
            paced: true,
        }
    }

    /// End the stream after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Produce frames as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        // vertical bar sweeping left to right, one column per frame
        let bar = (self.sequence as usize) % w;
        let bar_width = (w / 16).max(1);
        for y in 0..h {
            let shade = (y * 255 / h.max(1)) as u8;
            for x in 0..w {
                let px = &mut data[(y * w + x) * 3..(y * w + x) * 3 + 3];
                if x >= bar && x < bar + bar_width {
                    px.copy_from_slice(&[255, 255, 255]);
                } else {
                    px.copy_from_slice(&[shade / 4, shade / 2, shade]);
                }
            }
        }
        data
    }
}

impl Capture for PatternCapture {
    fn read(&mut self) -> Option<Frame> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return None;
        }

        if self.paced {
            let interval = Duration::from_secs_f64(1.0 / self.fps);
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                thread::sleep(due - now);
            }
            // never schedule into the past after a slow consumer
            self.next_due = Some(due.max(now) + interval);
        }

        self.sequence += 1;
        Some(Frame::new(
            self.render(),
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ))
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}
