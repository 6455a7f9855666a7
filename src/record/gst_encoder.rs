//! H.264/MP4 recording through a GStreamer appsrc pipeline

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};

use crate::capture::{decoder, Frame};
use crate::error::RecorderError;

use super::y4m::fps_ratio;
use super::{EncodeService, VideoWriter};

pub struct GstEncoder;

fn encoder_error(e: impl std::fmt::Display) -> RecorderError {
    RecorderError::Encoder(e.to_string())
}

impl EncodeService for GstEncoder {
    fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoWriter>, RecorderError> {
        gst::init().map_err(encoder_error)?;

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time ! \
             videoconvert ! \
             x264enc tune=zerolatency speed-preset=veryfast ! \
             mp4mux ! \
             filesink location=\"{}\"",
            path.display()
        );
        info!("Recorder pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(encoder_error)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| encoder_error("failed to create pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| encoder_error("failed to find appsrc element"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| encoder_error("failed to cast to AppSrc"))?;

        let (num, den) = fps_ratio(fps);
        let caps = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
            .fps(gst::Fraction::new(num as i32, den as i32))
            .build()
            .map_err(encoder_error)?
            .to_caps()
            .map_err(encoder_error)?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| encoder_error(format!("failed to start recorder: {e:?}")))?;

        Ok(Box::new(GstWriter {
            pipeline,
            appsrc,
            width,
            height,
            frame_duration: gst::ClockTime::from_nseconds(1_000_000_000 * den / num.max(1)),
            frames: 0,
        }))
    }

    fn name(&self) -> &'static str {
        "gstreamer-h264"
    }
}

struct GstWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    width: u32,
    height: u32,
    frame_duration: gst::ClockTime,
    frames: u64,
}

impl VideoWriter for GstWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(RecorderError::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }

        let mut buffer = gst::Buffer::from_mut_slice(decoder::to_rgb(frame)?);
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| encoder_error("buffer is not writable"))?;
            buffer.set_pts(self.frame_duration * self.frames);
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc.push_buffer(buffer).map_err(encoder_error)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecorderError> {
        self.appsrc.end_of_stream().map_err(encoder_error)?;

        // mp4mux only writes its index once EOS has travelled through
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| encoder_error("pipeline has no bus"))?;
        let message = bus.timed_pop_filtered(
            gst::ClockTime::from_seconds(5),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        let result = match message.as_ref().map(|m| m.view()) {
            Some(gst::MessageView::Eos(..)) => Ok(()),
            Some(gst::MessageView::Error(err)) => Err(encoder_error(err.error())),
            _ => {
                warn!("recorder pipeline did not confirm end of stream");
                Ok(())
            }
        };

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| encoder_error(format!("failed to stop recorder: {e:?}")))?;
        result
    }
}
