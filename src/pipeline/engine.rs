//! Delay engine: ingestion loop, the two ring buffers and the latest-frame slot

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{Frame, FrameSource, SourceHealth, SourceKind, SourceMonitor};
use crate::error::{EngineError, SettingsError};
use crate::record::{EncodeService, Recorder, RecordingSwitch};
use crate::PipelineConfig;

use super::rate::RateMeter;
use super::ringbuf::RingBuffer;
use super::settings::{Capacities, Settings};
use super::slot::{LatestFrameSlot, Writer};

/// Buffer state guarded by the engine's single coarse lock
struct Buffers {
    delay: RingBuffer<Frame>,
    replay: RingBuffer<Frame>,
    settings: Settings,
}

/// Lock-free counters readable while ingestion runs
#[derive(Default)]
pub struct EngineStats {
    ingested: AtomicU64,
    displayed: AtomicU64,
    recorded: AtomicU64,
    empty_reads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ingested: u64,
    pub displayed: u64,
    pub recorded: u64,
    pub empty_reads: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferFill {
    pub delay_len: usize,
    pub delay_capacity: usize,
    pub replay_len: usize,
    pub replay_capacity: usize,
}

/// Consistent copy of the replay buffer plus the settings it was taken under
pub struct ReplaySnapshot {
    pub frames: Vec<Frame>,
    pub settings: Settings,
}

/// State shared by ingestion, replay and the render tick
pub struct EngineShared {
    buffers: Mutex<Buffers>,
    settings: ArcSwap<Settings>,
    slot: LatestFrameSlot,
    stats: CachePadded<EngineStats>,
}

impl EngineShared {
    pub fn new(settings: Settings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let caps = settings.capacities();
        Ok(Self {
            buffers: Mutex::new(Buffers {
                delay: RingBuffer::new(caps.delay),
                replay: RingBuffer::new(caps.replay),
                settings,
            }),
            settings: ArcSwap::from_pointee(settings),
            slot: LatestFrameSlot::new(),
            stats: CachePadded::new(EngineStats::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slot(&self) -> &LatestFrameSlot {
        &self.slot
    }

    pub fn settings(&self) -> Settings {
        **self.settings.load()
    }

    /// Buffer a freshly captured frame and, while live, publish the frame
    /// to display: the oldest delayed frame once the delay buffer is full,
    /// the frame itself while it is still filling.
    pub fn admit(&self, frame: Frame) -> bool {
        let display = {
            let mut buffers = self.lock();
            // payloads are immutable, so both buffers can share them
            buffers.delay.push(frame.clone());
            buffers.replay.push(frame.clone());
            if buffers.delay.is_full() {
                buffers.delay.oldest().cloned().unwrap_or(frame)
            } else {
                frame
            }
        };
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);

        let shown = self.slot.publish(Writer::Ingest, display);
        if shown {
            self.stats.displayed.fetch_add(1, Ordering::Relaxed);
        }
        shown
    }

    /// Validate and apply new settings, resizing both buffers atomically
    pub fn reconfigure(&self, settings: Settings) -> Result<Capacities, SettingsError> {
        self.update(|_| settings)
    }

    /// Derive new settings from the current ones under the buffer lock
    pub fn update(
        &self,
        change: impl FnOnce(Settings) -> Settings,
    ) -> Result<Capacities, SettingsError> {
        let mut buffers = self.lock();
        let next = change(buffers.settings);
        let caps = self.apply(&mut buffers, next)?;
        drop(buffers);

        info!(
            delay_frames = caps.delay,
            replay_frames = caps.replay,
            fps = next.measured_fps,
            speed = next.playback_speed_factor,
            "buffers reconfigured"
        );
        Ok(caps)
    }

    fn apply(&self, buffers: &mut Buffers, settings: Settings) -> Result<Capacities, SettingsError> {
        settings.validate()?;
        let caps = settings.capacities();

        // allocate both before touching either buffer
        let delay = (caps.delay != buffers.delay.capacity()).then(|| RingBuffer::new(caps.delay));
        let replay = (caps.replay != buffers.replay.capacity()).then(|| RingBuffer::new(caps.replay));
        if let Some(next) = delay {
            buffers.delay.replace_storage(next);
        }
        if let Some(next) = replay {
            buffers.replay.replace_storage(next);
        }
        buffers.settings = settings;
        self.settings.store(Arc::new(settings));
        Ok(caps)
    }

    /// Adopt a measured frame rate if it drifted more than `tolerance` (relative)
    pub fn adopt_measured_fps(&self, fps: f64, tolerance: f64) -> Option<Capacities> {
        let mut buffers = self.lock();
        let current = buffers.settings.measured_fps;
        let drift = ((fps - current) / current).abs();
        if !(drift > tolerance) {
            return None;
        }
        let next = buffers.settings.with_fps(fps);
        match self.apply(&mut buffers, next) {
            Ok(caps) => {
                drop(buffers);
                metrics::gauge!("velo_measured_fps").set(fps);
                info!(
                    from = current,
                    to = fps,
                    delay_frames = caps.delay,
                    replay_frames = caps.replay,
                    "stream rate changed"
                );
                Some(caps)
            }
            Err(e) => {
                debug!("ignoring measured rate {}: {}", fps, e);
                None
            }
        }
    }

    pub fn replay_snapshot(&self) -> ReplaySnapshot {
        let buffers = self.lock();
        ReplaySnapshot {
            frames: buffers.replay.snapshot(),
            settings: buffers.settings,
        }
    }

    pub fn fill(&self) -> BufferFill {
        let buffers = self.lock();
        BufferFill {
            delay_len: buffers.delay.len(),
            delay_capacity: buffers.delay.capacity(),
            replay_len: buffers.replay.len(),
            replay_capacity: buffers.replay.capacity(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            ingested: self.stats.ingested.load(Ordering::Relaxed),
            displayed: self.stats.displayed.load(Ordering::Relaxed),
            recorded: self.stats.recorded.load(Ordering::Relaxed),
            empty_reads: self.stats.empty_reads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Requested,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub frames: u64,
    pub recorded: u64,
    pub reason: StopReason,
}

/// Where and how the session recording is written
#[derive(Clone)]
pub struct RecorderSetup {
    pub path: PathBuf,
    pub service: Arc<dyn EncodeService>,
    pub switch: RecordingSwitch,
}

struct Ingest {
    label: String,
    running: Arc<AtomicBool>,
    monitor: SourceMonitor,
    handle: JoinHandle<IngestReport>,
}

pub struct DelayEngine {
    shared: Arc<EngineShared>,
    pipeline: PipelineConfig,
    recorder: RecorderSetup,
    ingest: Mutex<Option<Ingest>>,
    /// Serialises `start`; `ingest` itself is only held briefly
    starting: Mutex<()>,
}

impl DelayEngine {
    pub fn new(
        settings: Settings,
        pipeline: PipelineConfig,
        recorder: RecorderSetup,
    ) -> Result<Self, SettingsError> {
        Ok(Self {
            shared: Arc::new(EngineShared::new(settings)?),
            pipeline,
            recorder,
            ingest: Mutex::new(None),
            starting: Mutex::new(()),
        })
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    fn ingest(&self) -> MutexGuard<'_, Option<Ingest>> {
        self.ingest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `source` and run the ingestion loop on its own thread, replacing
    /// any running loop. Buffers are left alone if the source fails to open.
    ///
    /// Opening can block for seconds on a network source; status queries
    /// keep answering meanwhile and report no source.
    #[instrument(skip_all, fields(source = source.label()))]
    pub fn start(&self, mut source: Box<dyn FrameSource>) -> Result<(), EngineError> {
        let _starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        // the previous loop may hold the same device
        let previous = self.ingest().take();
        if let Some(previous) = previous {
            Self::join(previous);
        }

        source.open()?;

        // seed with the advertised rate until the measured one is known
        if let Some(fps) = source.nominal_fps() {
            if let Err(e) = self.shared.update(|current| current.with_fps(fps)) {
                warn!("ignoring advertised rate {}: {}", fps, e);
            }
        }

        let label = source.label().to_string();
        let monitor = source.monitor();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = IngestContext {
            shared: self.shared.clone(),
            pipeline: self.pipeline.clone(),
            recorder: Recorder::new(
                self.recorder.path.clone(),
                self.recorder.service.clone(),
                self.recorder.switch.clone(),
            ),
            running: running.clone(),
        };

        let handle = thread::Builder::new()
            .name("velo-ingest".into())
            .spawn(move || run_ingest(ctx, source))
            .map_err(|e| EngineError::Spawn {
                name: "ingest",
                source: e,
            })?;

        info!(source = %label, "ingestion started");
        *self.ingest() = Some(Ingest {
            label,
            running,
            monitor,
            handle,
        });
        Ok(())
    }

    /// Stop ingestion and wait for the source and recording to be closed
    pub fn stop(&self) -> Option<IngestReport> {
        let ingest = self.ingest().take()?;
        Self::join(ingest)
    }

    fn join(ingest: Ingest) -> Option<IngestReport> {
        ingest.running.store(false, Ordering::Release);
        match ingest.handle.join() {
            Ok(report) => {
                info!(
                    source = %ingest.label,
                    frames = report.frames,
                    recorded = report.recorded,
                    reason = ?report.reason,
                    "ingestion stopped"
                );
                Some(report)
            }
            Err(_) => {
                error!(source = %ingest.label, "ingestion thread panicked");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.ingest()
            .as_ref()
            .is_some_and(|ingest| ingest.running.load(Ordering::Acquire) && !ingest.handle.is_finished())
    }

    pub fn source_label(&self) -> Option<String> {
        self.ingest().as_ref().map(|ingest| ingest.label.clone())
    }

    pub fn source_health(&self) -> Option<SourceHealth> {
        self.ingest().as_ref().map(|ingest| ingest.monitor.health())
    }

    pub fn reconfigure(&self, settings: Settings) -> Result<Capacities, SettingsError> {
        self.shared.reconfigure(settings)
    }
}

impl Drop for DelayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct IngestContext {
    shared: Arc<EngineShared>,
    pipeline: PipelineConfig,
    recorder: Recorder,
    running: Arc<AtomicBool>,
}

fn run_ingest(mut ctx: IngestContext, mut source: Box<dyn FrameSource>) -> IngestReport {
    if let Some(core) = ctx.pipeline.ingest_core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            warn!(core, "could not pin ingestion thread");
        }
    }

    let poll = Duration::from_millis(ctx.pipeline.poll_interval_ms);
    let mut meter = RateMeter::new(ctx.pipeline.fps_window);
    let mut frames = 0u64;

    let reason = loop {
        if !ctx.running.load(Ordering::Acquire) {
            break StopReason::Requested;
        }

        let Some(frame) = source.read_next() else {
            if source.kind() == SourceKind::Local {
                info!(source = source.label(), "end of stream");
                break StopReason::EndOfStream;
            }
            ctx.shared.stats.empty_reads.fetch_add(1, Ordering::Relaxed);
            thread::sleep(poll);
            continue;
        };

        if !ctx.recorder.is_open() {
            ctx.recorder.open(&frame, ctx.shared.settings().measured_fps);
        }
        // recordings take the raw frame, never the delayed or annotated one
        if ctx.recorder.record(&frame) {
            ctx.shared.stats.recorded.fetch_add(1, Ordering::Relaxed);
        }

        let arrived = frame.timestamp;
        ctx.shared.admit(frame);
        frames += 1;
        metrics::counter!("velo_frames_ingested_total").increment(1);

        if ctx.pipeline.measure_fps {
            if let Some(fps) = meter.observe(arrived) {
                ctx.shared.adopt_measured_fps(fps, ctx.pipeline.fps_tolerance);
            }
        }
    };

    ctx.running.store(false, Ordering::Release);
    source.close();
    ctx.recorder.finish();

    IngestReport {
        frames,
        recorded: ctx.recorder.written(),
        reason,
    }
}
