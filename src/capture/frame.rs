use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
///
/// The payload is immutable once produced, so clones share it across threads.
/// Anything drawn for display goes into a new payload via [`Frame::derive`].
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp, used for rate measurement and latency tracking
    pub timestamp: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row for packed formats, 0 for compressed ones
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Payload size of one uncompressed frame, `None` for MJPEG
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let px = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(px * 3),
            PixelFormat::Yuyv4 => Some(px * 2),
            PixelFormat::Nv12 => Some(px + px / 2),
            PixelFormat::Mjpeg => None,
        }
    }

    pub fn stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv4 => width * 2,
            PixelFormat::Nv12 => width,
            PixelFormat::Mjpeg => 0,
        }
    }
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: format.stride(width),
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    /// A new frame with a replacement payload that keeps this frame's
    /// sequence number and capture time
    pub fn derive(&self, data: impl Into<Bytes>, format: PixelFormat) -> Self {
        let mut meta = FrameMetadata::clone(&self.meta);
        meta.format = format;
        meta.stride = format.stride(meta.width);
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp: self.timestamp,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("size", &format_args!("{}x{}", self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
