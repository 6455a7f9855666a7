pub mod decoder;
pub mod frame;
pub mod network;
pub mod pattern;
pub mod source;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use network::NetworkSource;
pub use pattern::PatternCapture;
pub use source::{Capture, Connector, FrameSource, LocalSource, SourceHealth, SourceKind, SourceMonitor};
#[cfg(feature = "v4l2-capture")]
pub use v4l2::V4l2Capture;
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCapture;
