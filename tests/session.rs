use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use velo::capture::{Capture, Frame, LocalSource, NetworkSource, PatternCapture, PixelFormat};
use velo::error::{EngineError, RecorderError, SourceError};
use velo::pipeline::{Mode, ReplayToggle};
use velo::record::{EncodeService, VideoWriter};
use velo::{Config, ReplaySettings, Session};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.capture.fps = 10.0;
    config.replay.delay_seconds = 1.0;
    config.replay.replay_seconds = 1.0;
    // 2 s per replayed frame, so a run outlives each test step
    config.replay.playback_speed_factor = 0.05;
    config.pipeline.measure_fps = false;
    config.pipeline.poll_interval_ms = 1;
    config.network.retry_backoff_ms = 1;
    config.network.join_timeout_ms = 500;
    config.recording.path = dir.join("session.y4m");
    config
}

fn payload(seq: u64) -> Vec<u8> {
    vec![seq as u8; 4 * 4 * 3]
}

fn frame(seq: u64) -> Frame {
    Frame::new(payload(seq), seq, 4, 4, PixelFormat::Rgb24)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Local capture that yields whatever the test sends; dropping the sender ends the stream
struct Gated(flume::Receiver<Frame>);

impl Capture for Gated {
    fn read(&mut self) -> Option<Frame> {
        self.0.recv().ok()
    }
}

fn gated_source(rx: flume::Receiver<Frame>) -> Box<LocalSource> {
    Box::new(LocalSource::new(
        "gated",
        Box::new(move || Ok(Box::new(Gated(rx.clone())) as Box<dyn Capture>)),
    ))
}

/// In-memory encode service keeping every written frame
#[derive(Clone, Default)]
struct MemorySink(Arc<Mutex<Vec<(u64, Vec<u8>)>>>);

impl VideoWriter for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        self.0.lock().unwrap().push((frame.sequence(), frame.data.to_vec()));
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecorderError> {
        Ok(())
    }
}

impl EncodeService for MemorySink {
    fn open(&self, _: &Path, _: f64, _: u32, _: u32) -> Result<Box<dyn VideoWriter>, RecorderError> {
        Ok(Box::new(self.clone()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[test]
fn recording_takes_raw_frames_in_any_mode() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::default();
    let session = Session::with_encoder(config(dir.path()), Arc::new(sink.clone())).unwrap();
    let (tx, rx) = flume::unbounded();

    assert!(session.toggle_recording());
    session.start_with(gated_source(rx)).unwrap();

    for seq in 1..=15 {
        tx.send(frame(seq)).unwrap();
    }
    wait_until("first batch", || session.status().stats.ingested == 15);
    // delay buffer holds 10 frames, so 6 is on screen
    assert_eq!(session.latest_frame().unwrap().sequence(), 6);

    let started = session.toggle_replay().unwrap();
    assert!(matches!(started, ReplayToggle::Started { frames: 10, .. }));
    wait_until("first replayed frame", || {
        let shown = session.latest_frame().unwrap();
        shown.data.to_vec() != payload(shown.sequence())
    });

    for seq in 16..=30 {
        tx.send(frame(seq)).unwrap();
    }
    wait_until("second batch", || session.status().stats.ingested == 30);

    let shown = session.latest_frame().unwrap();
    assert_eq!(session.status().mode, Mode::Replaying);
    assert_ne!(shown.data.to_vec(), payload(shown.sequence()), "display carries the overlay");

    drop(tx);
    wait_until("end of stream", || !session.status().ingesting);
    session.shutdown();

    let recorded = sink.0.lock().unwrap();
    let expected: Vec<(u64, Vec<u8>)> = (1..=30).map(|seq| (seq, payload(seq))).collect();
    assert_eq!(*recorded, expected);
}

/// Network capture following a script; `None` is a failed read
struct Scripted(VecDeque<Option<u64>>);

impl Capture for Scripted {
    fn read(&mut self) -> Option<Frame> {
        match self.0.pop_front() {
            Some(entry) => entry.map(frame),
            None => {
                thread::sleep(Duration::from_millis(1));
                None
            }
        }
    }
}

#[test]
fn network_gap_keeps_last_frame_on_screen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let network = config.network.clone();
    let session = Session::new(config).unwrap();

    let mut script: VecDeque<Option<u64>> = VecDeque::new();
    script.push_back(Some(1));
    script.extend(std::iter::repeat(None).take(10));
    script.push_back(Some(2));
    let mut script = Some(script);

    let source = NetworkSource::new(
        "rtsp://camera.test/gap",
        Box::new(move || {
            let script = script.take().ok_or(SourceError::Closed)?;
            Ok(Box::new(Scripted(script)) as Box<dyn Capture>)
        }),
        &network,
    );
    session.start_with(Box::new(source)).unwrap();

    let mut seen_first = false;
    wait_until("frame after the gap", || match session.latest_frame() {
        Some(frame) => {
            seen_first = true;
            frame.sequence() == 2
        }
        None => {
            assert!(!seen_first, "display went blank during the gap");
            false
        }
    });

    let status = session.status();
    assert!(status.stats.empty_reads > 0);
    // each arrival is buffered once, however often the slot was polled
    assert_eq!(status.fill.delay_len, 2);
    session.shutdown();
}

#[test]
fn second_toggle_cancels_replay() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(dir.path())).unwrap();
    let (tx, rx) = flume::unbounded();
    session.start_with(gated_source(rx)).unwrap();

    for seq in 1..=5 {
        tx.send(frame(seq)).unwrap();
    }
    wait_until("frames", || session.status().stats.ingested == 5);

    assert!(matches!(session.toggle_replay().unwrap(), ReplayToggle::Started { .. }));
    assert_eq!(session.status().mode, Mode::Replaying);
    assert_eq!(session.toggle_replay().unwrap(), ReplayToggle::Cancelled);
    assert_eq!(session.status().mode, Mode::Live);

    // ingestion owns the display again
    tx.send(frame(6)).unwrap();
    wait_until("live frame", || session.latest_frame().unwrap().sequence() == 6);
    assert_eq!(session.latest_frame().unwrap().data.to_vec(), payload(6));
    drop(tx);
}

#[test]
fn replay_with_empty_buffer_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(dir.path())).unwrap();
    assert_eq!(session.toggle_replay().unwrap(), ReplayToggle::NothingToReplay);
    assert_eq!(session.status().mode, Mode::Live);
}

#[test]
fn unavailable_source_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(dir.path())).unwrap();
    let source = LocalSource::new(
        "/dev/video7",
        Box::new(|| Err(SourceError::unavailable("/dev/video7", "no such device"))),
    );

    let err = session.start_with(Box::new(source)).unwrap_err();
    assert!(matches!(err, EngineError::Source(SourceError::Unavailable { .. })));

    let status = session.status();
    assert!(!status.ingesting);
    assert_eq!(status.source, None);
    assert_eq!(status.fill.delay_len, 0);
    assert!(session.latest_frame().is_none());
}

#[test]
fn snapshots_are_contiguous_under_concurrent_pushes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.capture.fps = 100.0;
    let session = Session::new(config).unwrap();
    let shared = session.engine().shared().clone();

    let pusher = {
        let shared = shared.clone();
        thread::spawn(move || {
            for seq in 1..=5_000 {
                shared.admit(Frame::new(vec![0u8; 3], seq, 1, 1, PixelFormat::Rgb24));
            }
        })
    };

    let mut checked = 0;
    while !pusher.is_finished() || checked == 0 {
        let frames = shared.replay_snapshot().frames;
        assert!(frames.len() <= 100);
        let seqs: Vec<u64> = frames.iter().map(|f| f.sequence()).collect();
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "snapshot skipped or repeated a frame");
        }
        checked += 1;
    }
    pusher.join().unwrap();

    let last = shared.replay_snapshot().frames;
    assert_eq!(last.first().map(|f| f.sequence()), Some(4_901));
    assert_eq!(last.last().map(|f| f.sequence()), Some(5_000));
}

#[test]
fn reconfiguring_during_ingestion_loses_no_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.capture.fps = 100.0;
    let session = Session::new(config).unwrap();
    let shared = session.engine().shared().clone();
    let base = session.replay_settings();

    let pusher = {
        let shared = shared.clone();
        thread::spawn(move || {
            for seq in 1..=5_000 {
                shared.admit(Frame::new(vec![0u8; 3], seq, 1, 1, PixelFormat::Rgb24));
            }
        })
    };

    let mut round = 0u32;
    while !pusher.is_finished() || round == 0 {
        let replay_seconds = if round % 2 == 0 { 0.5 } else { 1.0 };
        let caps = session
            .reconfigure(&ReplaySettings {
                replay_seconds,
                ..base.clone()
            })
            .unwrap();
        assert_eq!(caps.replay, (replay_seconds * 100.0) as usize);

        let snapshot = shared.replay_snapshot();
        assert!(snapshot.frames.len() <= snapshot.settings.capacities().replay);
        let seqs: Vec<u64> = snapshot.frames.iter().map(|f| f.sequence()).collect();
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "resize dropped or reordered a frame");
        }
        round += 1;
    }
    pusher.join().unwrap();

    assert_eq!(session.status().stats.ingested, 5_000);
    // a final grow keeps what the smaller buffer held
    let last = shared.replay_snapshot();
    let len = last.frames.len() as u64;
    assert!(len >= 50 && len <= last.settings.capacities().replay as u64);
    assert_eq!(last.frames.first().map(|f| f.sequence()), Some(5_001 - len));
    assert_eq!(last.frames.last().map(|f| f.sequence()), Some(5_000));
}

/// Encode service whose files accept `limit` frames, then fail every write
struct FailingAfter {
    limit: u64,
}

struct FailingWriter {
    written: u64,
    limit: u64,
}

impl VideoWriter for FailingWriter {
    fn write(&mut self, _: &Frame) -> Result<(), RecorderError> {
        if self.written == self.limit {
            return Err(RecorderError::Encoder("disk full".into()));
        }
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecorderError> {
        Ok(())
    }
}

impl EncodeService for FailingAfter {
    fn open(&self, _: &Path, _: f64, _: u32, _: u32) -> Result<Box<dyn VideoWriter>, RecorderError> {
        Ok(Box::new(FailingWriter {
            written: 0,
            limit: self.limit,
        }))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[test]
fn recorder_failure_stops_recording_but_not_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let session =
        Session::with_encoder(config(dir.path()), Arc::new(FailingAfter { limit: 3 })).unwrap();
    let (tx, rx) = flume::unbounded();

    assert!(session.toggle_recording());
    session.start_with(gated_source(rx)).unwrap();

    for seq in 1..=5 {
        tx.send(frame(seq)).unwrap();
    }
    wait_until("first batch", || session.status().stats.ingested == 5);

    let status = session.status();
    assert!(!status.recording, "write failure switches recording off");
    assert!(status.ingesting);
    assert_eq!(status.stats.recorded, 3);

    for seq in 6..=10 {
        tx.send(frame(seq)).unwrap();
    }
    wait_until("second batch", || session.status().stats.ingested == 10);
    assert!(session.status().ingesting);
    assert!(!session.is_recording());

    drop(tx);
    let report = session.shutdown().unwrap();
    assert_eq!(report.frames, 10);
    assert_eq!(report.recorded, 3);
}

#[test]
fn recording_file_is_closed_on_shutdown_and_discardable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.capture.fps = 30.0;
    let session = Session::new(config).unwrap();
    session.toggle_recording();

    let source = LocalSource::new(
        "pattern:8x4",
        Box::new(|| {
            Ok(Box::new(PatternCapture::new(8, 4, 30.0).unpaced().with_limit(20)) as Box<dyn Capture>)
        }),
    );
    session.start_with(Box::new(source)).unwrap();
    wait_until("end of stream", || !session.status().ingesting);

    let report = session.shutdown().unwrap();
    assert_eq!(report.frames, 20);
    assert_eq!(report.recorded, 20);

    let bytes = std::fs::read(session.recording_path()).unwrap();
    let header = b"YUV4MPEG2 W8 H4 F30:1 Ip A1:1 C444\n";
    assert!(bytes.starts_with(header));
    assert_eq!(bytes.len(), header.len() + 20 * (6 + 8 * 4 * 3));

    assert!(session.discard_recording().unwrap());
    assert!(!session.recording_path().exists());
}

#[test]
fn pattern_spec_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(dir.path())).unwrap();
    session.start_source("pattern:16x8").unwrap();
    wait_until("pattern frames", || session.status().stats.ingested >= 3);

    let status = session.status();
    assert_eq!(status.source.as_deref(), Some("pattern:16x8"));
    assert!(status.ingesting);
    assert_eq!(session.latest_frame().unwrap().width(), 16);
    assert!(matches!(
        session.discard_recording(),
        Err(EngineError::StillRunning)
    ));
    session.shutdown();
}
