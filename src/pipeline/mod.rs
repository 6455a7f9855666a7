pub mod engine;
pub mod overlay;
pub mod rate;
pub mod replay;
pub mod ringbuf;
pub mod settings;
pub mod slot;

pub use engine::{
    BufferFill, DelayEngine, EngineShared, IngestReport, RecorderSetup, ReplaySnapshot,
    StatsSnapshot, StopReason,
};
pub use rate::RateMeter;
pub use replay::{ReplayController, ReplayOutcome, ReplayToggle};
pub use ringbuf::RingBuffer;
pub use settings::{frame_interval, recompute_capacities, Capacities, Settings, MAX_BUFFER_FRAMES};
pub use slot::{LatestFrameSlot, Mode, ReplayTicket, Writer};
