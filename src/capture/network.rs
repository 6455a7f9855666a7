//! Network stream reader decoupled from the ingestion loop
//!
//! A background thread performs the blocking reads and overwrites a single
//! shared slot with the newest decoded frame. The foreground never waits on
//! the network: it takes whatever the slot holds, if it has not seen it yet.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::error::SourceError;
use crate::NetworkConfig;

use super::frame::Frame;
use super::source::{Capture, Connector, FrameSource, SourceKind, SourceMonitor};

/// Newest frame from the reader thread with its arrival number
struct Stamped {
    arrival: u64,
    frame: Frame,
}

pub struct NetworkSource {
    label: String,
    connector: Connector,
    backoff: Duration,
    join_timeout: Duration,
    stale_after: Duration,
    latest: Arc<ArcSwapOption<Stamped>>,
    monitor: SourceMonitor,
    delivered: u64,
    nominal_fps: Option<f64>,
    reader: Option<Reader>,
}

struct Reader {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl NetworkSource {
    pub fn new(label: impl Into<String>, connector: Connector, config: &NetworkConfig) -> Self {
        Self {
            label: label.into(),
            connector,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            stale_after: Duration::from_millis(config.stale_after_ms),
            latest: Arc::new(ArcSwapOption::empty()),
            monitor: SourceMonitor::tracked(Duration::from_millis(config.stale_after_ms)),
            delivered: 0,
            nominal_fps: None,
            reader: None,
        }
    }
}

impl FrameSource for NetworkSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Network
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.reader.is_some() {
            return Ok(());
        }

        let mut capture = (self.connector)()?;

        // Each connection gets its own slot and watchdog, so a reader detached
        // by an earlier close cannot feed this one
        self.latest = Arc::new(ArcSwapOption::empty());
        self.monitor = SourceMonitor::tracked(self.stale_after);
        self.delivered = 0;

        // Prime the slot so the first foreground read has something to show
        let mut arrival = 0;
        match capture.read() {
            Some(frame) => {
                arrival = 1;
                self.latest.store(Some(Arc::new(Stamped { arrival, frame })));
                self.monitor.record_frame();
            }
            None => warn!(source = %self.label, "no initial frame, reader will keep retrying"),
        }
        // decoders often learn the rate from the first sample
        self.nominal_fps = capture.nominal_fps();

        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded::<()>(0);
        let ctx = ReaderContext {
            label: self.label.clone(),
            latest: self.latest.clone(),
            monitor: self.monitor.clone(),
            backoff: self.backoff,
            arrival,
        };

        let handle = thread::Builder::new()
            .name("velo-net-reader".into())
            .spawn(move || {
                let _done = done_tx;
                let _alive = AliveGuard(ctx.monitor.clone());
                run_reader(ctx, capture, stop_rx);
            })
            .map_err(|e| SourceError::unavailable(self.label.clone(), e))?;

        self.reader = Some(Reader {
            stop_tx,
            done_rx,
            handle,
        });
        info!(source = %self.label, backoff = ?self.backoff, "network source opened");
        Ok(())
    }

    fn read_next(&mut self) -> Option<Frame> {
        let guard = self.latest.load();
        let stamped = guard.as_ref()?;
        if stamped.arrival <= self.delivered {
            return None;
        }
        self.delivered = stamped.arrival;
        Some(stamped.frame.clone())
    }

    fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        self.monitor.mark_closing();
        let _ = reader.stop_tx.try_send(());

        // The done channel disconnects when the reader thread exits
        match reader.done_rx.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    source = %self.label,
                    timeout = ?self.join_timeout,
                    "network reader did not stop in time, detaching it"
                );
            }
            _ => {
                if reader.handle.join().is_err() {
                    error!(source = %self.label, "network reader panicked");
                }
                info!(source = %self.label, "network source closed");
            }
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.nominal_fps
    }

    fn monitor(&self) -> SourceMonitor {
        self.monitor.clone()
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct ReaderContext {
    label: String,
    latest: Arc<ArcSwapOption<Stamped>>,
    monitor: SourceMonitor,
    backoff: Duration,
    arrival: u64,
}

/// Flags the monitor when the reader thread ends, including by panic
struct AliveGuard(SourceMonitor);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.mark_reader_exited();
    }
}

fn run_reader(mut ctx: ReaderContext, mut capture: Box<dyn Capture>, stop_rx: Receiver<()>) {
    debug!(source = %ctx.label, "network reader started");
    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match capture.read() {
            Some(frame) => {
                ctx.arrival += 1;
                ctx.latest.store(Some(Arc::new(Stamped {
                    arrival: ctx.arrival,
                    frame,
                })));
                ctx.monitor.record_frame();
            }
            None => {
                let failures = ctx.monitor.record_failure();
                metrics::counter!("velo_source_stutters_total").increment(1);
                warn!(
                    source = %ctx.label,
                    failures,
                    "network stutter, keeping last frame and retrying"
                );
                match stop_rx.recv_timeout(ctx.backoff) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
    }
    capture.release();
    debug!(source = %ctx.label, "network reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::SourceHealth;
    use crate::capture::PixelFormat;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Plays back a script of reads; `None` entries are failed reads
    struct Scripted {
        script: VecDeque<Option<u64>>,
    }

    impl Capture for Scripted {
        fn read(&mut self) -> Option<Frame> {
            match self.script.pop_front() {
                Some(Some(seq)) => Some(Frame::new(vec![0u8; 3], seq, 1, 1, PixelFormat::Rgb24)),
                Some(None) => None,
                None => {
                    thread::sleep(Duration::from_millis(1));
                    None
                }
            }
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            retry_backoff_ms: 1,
            stale_after_ms: 60_000,
            join_timeout_ms: 1_000,
        }
    }

    fn source(script: Vec<Option<u64>>) -> NetworkSource {
        let mut script = Some(Scripted {
            script: script.into(),
        });
        NetworkSource::new(
            "rtsp://camera.test/stream",
            Box::new(move || {
                script
                    .take()
                    .map(|s| Box::new(s) as Box<dyn Capture>)
                    .ok_or(SourceError::Closed)
            }),
            &config(),
        )
    }

    fn wait_for(source: &mut NetworkSource, seq: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(frame) = source.read_next() {
                if frame.sequence() == seq {
                    return true;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn each_frame_is_delivered_once() {
        let mut source = source(vec![Some(1)]);
        source.open().unwrap();
        assert_eq!(source.read_next().map(|f| f.sequence()), Some(1));
        assert!(source.read_next().is_none());
        source.close();
    }

    #[test]
    fn reader_survives_failed_reads() {
        let mut script = vec![Some(1)];
        script.extend(std::iter::repeat(None).take(10));
        script.push(Some(2));
        let mut source = source(script);
        source.open().unwrap();

        assert!(wait_for(&mut source, 2), "frame after the stutter never arrived");
        assert_ne!(source.monitor().health(), SourceHealth::Lost);
        source.close();
    }

    #[test]
    fn close_stops_the_reader() {
        let mut source = source(vec![Some(1)]);
        source.open().unwrap();
        let monitor = source.monitor();
        source.close();
        assert_eq!(monitor.health(), SourceHealth::Healthy);
        assert!(source.reader.is_none());
    }

    /// Serves one connection per entry of `connections`
    fn reconnecting(connections: Vec<Vec<Option<u64>>>) -> NetworkSource {
        let mut connections: VecDeque<Scripted> = connections
            .into_iter()
            .map(|script| Scripted {
                script: script.into(),
            })
            .collect();
        NetworkSource::new(
            "rtsp://camera.test/reconnect",
            Box::new(move || {
                connections
                    .pop_front()
                    .map(|s| Box::new(s) as Box<dyn Capture>)
                    .ok_or(SourceError::Closed)
            }),
            &config(),
        )
    }

    #[test]
    fn reopened_source_delivers_the_new_connection() {
        let mut source = reconnecting(vec![vec![Some(100), Some(101), Some(102)], vec![Some(200)]]);
        source.open().unwrap();
        assert!(wait_for(&mut source, 102));
        source.close();

        source.open().unwrap();
        assert_eq!(source.read_next().map(|f| f.sequence()), Some(200));
        assert!(source.read_next().is_none());
        assert_eq!(source.monitor().health(), SourceHealth::Healthy);
        source.close();
    }

    /// Reports a rate only once it has produced a frame
    struct LateRate {
        started: bool,
    }

    impl Capture for LateRate {
        fn read(&mut self) -> Option<Frame> {
            self.started = true;
            thread::sleep(Duration::from_millis(1));
            Some(Frame::new(vec![0u8; 3], 1, 1, 1, PixelFormat::Rgb24))
        }

        fn nominal_fps(&self) -> Option<f64> {
            self.started.then_some(25.0)
        }
    }

    #[test]
    fn rate_learned_from_first_frame_is_advertised() {
        let mut source = NetworkSource::new(
            "rtsp://camera.test/late",
            Box::new(|| Ok(Box::new(LateRate { started: false }) as Box<dyn Capture>)),
            &config(),
        );
        source.open().unwrap();
        assert_eq!(source.nominal_fps(), Some(25.0));
        source.close();
    }

    #[test]
    fn connector_failure_is_reported() {
        let mut source = NetworkSource::new(
            "rtsp://nowhere",
            Box::new(|| Err(SourceError::unavailable("rtsp://nowhere", "connection refused"))),
            &config(),
        );
        assert!(source.open().is_err());
        assert!(source.read_next().is_none());
    }
}
