//! Runtime delay/replay settings and the arithmetic derived from them

use std::time::Duration;

use serde::Serialize;

use crate::error::SettingsError;
use crate::ReplaySettings;

/// Upper bound on either buffer, about 18 minutes at 60 fps
pub const MAX_BUFFER_FRAMES: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Settings {
    pub delay_seconds: f64,
    pub replay_seconds: f64,
    /// 0 < factor <= 1, smaller is slower
    pub playback_speed_factor: f64,
    /// Arrival rate of the stream, measured rather than advertised once known
    pub measured_fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacities {
    pub delay: usize,
    pub replay: usize,
}

/// `round(fps * seconds)` for both buffers; non-finite or negative products clamp to 0
pub fn recompute_capacities(fps: f64, delay_seconds: f64, replay_seconds: f64) -> Capacities {
    let frames = |seconds: f64| (fps * seconds).round().max(0.0) as usize;
    Capacities {
        delay: frames(delay_seconds),
        replay: frames(replay_seconds),
    }
}

/// Wall-clock time between replayed frames: `(1 / fps) / speed`
pub fn frame_interval(fps: f64, playback_speed_factor: f64) -> Duration {
    Duration::try_from_secs_f64((1.0 / fps) / playback_speed_factor).unwrap_or(Duration::ZERO)
}

impl Settings {
    pub fn from_replay(replay: &ReplaySettings, fps: f64) -> Self {
        Self {
            delay_seconds: replay.delay_seconds,
            replay_seconds: replay.replay_seconds,
            playback_speed_factor: replay.playback_speed_factor,
            measured_fps: fps,
        }
    }

    pub fn with_fps(self, measured_fps: f64) -> Self {
        Self {
            measured_fps,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        positive("delay_seconds", self.delay_seconds)?;
        positive("replay_seconds", self.replay_seconds)?;
        positive("measured_fps", self.measured_fps)?;

        let speed = self.playback_speed_factor;
        if !speed.is_finite() {
            return Err(SettingsError::NotFinite {
                field: "playback_speed_factor",
            });
        }
        if speed <= 0.0 || speed > 1.0 {
            return Err(SettingsError::SpeedOutOfRange(speed));
        }

        // checked on the float product, before any capacity is cast or allocated
        bounded("delay_seconds", self.measured_fps * self.delay_seconds)?;
        bounded("replay_seconds", self.measured_fps * self.replay_seconds)?;
        Ok(())
    }

    pub fn capacities(&self) -> Capacities {
        recompute_capacities(self.measured_fps, self.delay_seconds, self.replay_seconds)
    }

    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.measured_fps, self.playback_speed_factor)
    }

    /// Time span `frames` cover at the measured rate
    pub fn span(&self, frames: usize) -> Duration {
        Duration::try_from_secs_f64(frames as f64 / self.measured_fps).unwrap_or(Duration::ZERO)
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), SettingsError> {
    if !value.is_finite() {
        return Err(SettingsError::NotFinite { field });
    }
    if value <= 0.0 {
        return Err(SettingsError::NonPositive { field, value });
    }
    Ok(())
}

fn bounded(field: &'static str, frames: f64) -> Result<(), SettingsError> {
    if frames.round() > MAX_BUFFER_FRAMES as f64 {
        return Err(SettingsError::TooLarge {
            field,
            frames,
            max: MAX_BUFFER_FRAMES,
        });
    }
    Ok(())
}
