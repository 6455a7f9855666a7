//! GStreamer-based capture for network streams and anything `uridecodebin` can open

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::Capture;
use crate::error::SourceError;

/// How long a single pull may block before it counts as a failed read
const PULL_TIMEOUT_MS: u64 = 5000;

/// Decodes a stream to RGB through an appsink
pub struct GstCapture {
    uri: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    sequence: u64,
    nominal_fps: Option<f64>,
}

impl GstCapture {
    pub fn open(uri: &str) -> Result<Self, SourceError> {
        let unavailable = |e: &dyn std::fmt::Display| SourceError::unavailable(uri, e);

        gst::init().map_err(|e| unavailable(&e))?;

        let pipeline_str = Self::build_pipeline_string(uri);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| unavailable(&e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| unavailable(&"failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| unavailable(&"failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| unavailable(&"failed to cast to AppSink"))?;

        // Keep only the freshest buffer; stale network frames are worthless
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| unavailable(&format!("failed to start pipeline: {e:?}")))?;

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) => info!("Pipeline started successfully"),
            Ok(gst::StateChangeSuccess::Async) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline starting asynchronously")
            }
            Err(_) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(unavailable(&"pipeline refused to start"));
            }
        }

        Ok(Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            sequence: 0,
            nominal_fps: None,
        })
    }

    fn build_pipeline_string(uri: &str) -> String {
        format!(
            "uridecodebin uri={} ! \
             queue max-size-buffers=2 leaky=downstream ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            uri
        )
    }

    fn pull(&mut self) -> Result<Frame, String> {
        let timestamp = Instant::now();

        let sample = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            .ok_or("no sample (timeout or end of stream)")?;
        let buffer = sample.buffer().ok_or("sample contains no buffer")?;
        let map = buffer.map_readable().map_err(|_| "failed to map buffer")?;
        let caps = sample.caps().ok_or("sample has no caps")?;
        let video_info =
            gst_video::VideoInfo::from_caps(caps).map_err(|_| "failed to parse video info from caps")?;

        // rows may be padded, repack to a tight RGB24 layout
        let (width, height) = (video_info.width(), video_info.height());
        let row = width as usize * 3;
        let stride = video_info.stride()[0] as usize;
        let data = if stride == row {
            Bytes::copy_from_slice(&map.as_slice()[..row * height as usize])
        } else {
            let mut packed = Vec::with_capacity(row * height as usize);
            for line in map.as_slice().chunks(stride).take(height as usize) {
                packed.extend_from_slice(&line[..row]);
            }
            Bytes::from(packed)
        };

        if self.nominal_fps.is_none() {
            let fps = video_info.fps();
            if fps.numer() > 0 && fps.denom() > 0 {
                self.nominal_fps = Some(fps.numer() as f64 / fps.denom() as f64);
                debug!(fps = ?self.nominal_fps, "stream advertises frame rate");
            }
        }

        self.sequence += 1;
        Ok(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                stride: row as u32,
                format: PixelFormat::Rgb24,
                device_timestamp: buffer.pts().map(|pts| pts.into()),
            }),
            timestamp,
        })
    }
}

impl Capture for GstCapture {
    fn read(&mut self) -> Option<Frame> {
        match self.pull() {
            Ok(frame) => Some(frame),
            Err(reason) => {
                warn!(uri = %self.uri, "{}", reason);
                None
            }
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.nominal_fps
    }

    fn release(&mut self) {
        info!("Stopping GStreamer pipeline");
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
