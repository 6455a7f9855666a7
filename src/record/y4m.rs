//! Uncompressed YUV4MPEG2 writer, 4:4:4 planar

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::capture::{decoder, Frame};
use crate::error::RecorderError;

use super::{EncodeService, VideoWriter};

pub struct Y4mEncoder;

impl EncodeService for Y4mEncoder {
    fn open(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoWriter>, RecorderError> {
        let mut out = BufWriter::new(File::create(path)?);
        let (num, den) = fps_ratio(fps);
        writeln!(out, "YUV4MPEG2 W{width} H{height} F{num}:{den} Ip A1:1 C444")?;
        Ok(Box::new(Y4mWriter {
            out,
            width,
            height,
            planes: Vec::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "y4m"
    }
}

/// Frame rate as a rational, millihertz precision for fractional rates
pub fn fps_ratio(fps: f64) -> (u64, u64) {
    if !(fps.is_finite() && fps > 0.0) {
        return (30, 1);
    }
    if (fps - fps.round()).abs() < 1e-3 {
        (fps.round() as u64, 1)
    } else {
        ((fps * 1000.0).round() as u64, 1000)
    }
}

struct Y4mWriter {
    out: BufWriter<File>,
    width: u32,
    height: u32,
    planes: Vec<u8>,
}

impl VideoWriter for Y4mWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(RecorderError::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }

        let rgb = decoder::to_rgb(frame)?;
        let px = self.width as usize * self.height as usize;
        self.planes.resize(px * 3, 0);
        for (i, p) in rgb.chunks_exact(3).enumerate() {
            let [y, u, v] = decoder::rgb_to_yuv(p[0], p[1], p[2]);
            self.planes[i] = y;
            self.planes[px + i] = u;
            self.planes[2 * px + i] = v;
        }

        self.out.write_all(b"FRAME\n")?;
        self.out.write_all(&self.planes)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), RecorderError> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn ratio_for_common_rates() {
        assert_eq!(fps_ratio(30.0), (30, 1));
        assert_eq!(fps_ratio(29.97), (29970, 1000));
        assert_eq!(fps_ratio(0.0), (30, 1));
    }

    #[test]
    fn writes_header_and_planes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.y4m");

        let mut writer = Y4mEncoder.open(&path, 30.0, 2, 1).unwrap();
        let frame = Frame::new(vec![255u8; 6], 1, 2, 1, PixelFormat::Rgb24);
        writer.write(&frame).unwrap();
        writer.write(&frame).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = b"YUV4MPEG2 W2 H1 F30:1 Ip A1:1 C444\n";
        assert!(bytes.starts_with(header));
        assert_eq!(bytes.len(), header.len() + 2 * (6 + 6));
        // white is Y=235 with neutral chroma
        assert_eq!(&bytes[header.len() + 6..header.len() + 12], &[235, 235, 128, 128, 128, 128]);
    }

    #[test]
    fn rejects_resolution_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Y4mEncoder.open(&dir.path().join("a.y4m"), 30.0, 2, 2).unwrap();
        let frame = Frame::new(vec![0u8; 3], 1, 1, 1, PixelFormat::Rgb24);
        assert!(matches!(writer.write(&frame), Err(RecorderError::FrameSize { .. })));
    }
}
