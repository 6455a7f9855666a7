//! V4L2 capture for local devices

use std::time::{Duration, Instant};

use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture as _;
use v4l::{Device, FourCC};

use crate::{
    capture::frame::{Frame, FrameMetadata, PixelFormat},
    capture::source::Capture,
    error::SourceError,
    CaptureConfig,
};

/// Memory-mapped V4L2 capture
pub struct V4l2Capture {
    path: String,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    nominal_fps: Option<f64>,
    sequence: u64,
    _device: Device,
}

impl V4l2Capture {
    /// Open `path`, negotiate the configured format and start streaming
    pub fn open(path: &str, config: &CaptureConfig) -> Result<Self, SourceError> {
        info!("Initializing V4L2 capture: {}", path);
        let unavailable = |e: &dyn std::fmt::Display| SourceError::unavailable(path, e);

        let device = Device::with_path(path).map_err(|e| unavailable(&e))?;

        let caps = device.query_caps().map_err(|e| unavailable(&e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(unavailable(&"device doesn't support video capture"));
        }

        let mut fmt = device.format().map_err(|e| unavailable(&e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => return Err(unavailable(&format!("unsupported pixel format {other:?}"))),
        };
        // drivers may clamp the request, so keep what they actually granted
        let fmt = device.set_format(&fmt).map_err(|e| unavailable(&e))?;

        let nominal_fps = device.params().ok().and_then(|params| {
            let interval = params.interval;
            (interval.numerator > 0).then(|| interval.denominator as f64 / interval.numerator as f64)
        });

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(|e| unavailable(&e))?;
        info!(
            "Capture stream started with {} buffers at {}x{}",
            config.buffer_count, fmt.width, fmt.height
        );

        Ok(Self {
            path: path.to_string(),
            stream: Some(stream),
            width: fmt.width,
            height: fmt.height,
            format: config.format,
            nominal_fps,
            sequence: 0,
            _device: device,
        })
    }
}

impl Capture for V4l2Capture {
    #[instrument(skip(self), fields(path = %self.path))]
    fn read(&mut self) -> Option<Frame> {
        let timestamp = Instant::now();
        let stream = self.stream.as_mut()?;

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                warn!("capture failed: {}", e);
                return None;
            }
        };
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;
        let frame_meta = Arc::new(FrameMetadata {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            stride: self.format.stride(self.width),
            format: self.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        });

        Some(Frame {
            data,
            meta: frame_meta,
            timestamp,
        })
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.nominal_fps
    }

    fn release(&mut self) {
        // dropping the stream unmaps and dequeues the buffers
        self.stream = None;
    }
}
