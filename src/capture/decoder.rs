//! Conversion of captured payloads to packed RGB24
//!
//! Used by the replay overlay and by the recorder, both of which need plain
//! pixels regardless of what the device delivered.

use crate::error::DecodeError;

use super::frame::{Frame, PixelFormat};

/// Decode any supported frame payload into packed RGB24, `width * height * 3` bytes
pub fn to_rgb(frame: &Frame) -> Result<Vec<u8>, DecodeError> {
    let (width, height) = (frame.width(), frame.height());
    let data = &frame.data[..];

    if let Some(expected) = frame.format().frame_len(width, height) {
        if data.len() < expected {
            return Err(size_error(frame.format(), width, height, expected, data.len()));
        }
    }

    match frame.format() {
        PixelFormat::Rgb24 => Ok(data[..width as usize * height as usize * 3].to_vec()),
        PixelFormat::Bgr24 => Ok(bgr_to_rgb(data, width, height)),
        PixelFormat::Yuyv4 => Ok(yuyv_to_rgb(data, width, height)),
        PixelFormat::Nv12 => Ok(nv12_to_rgb(data, width, height)),
        PixelFormat::Mjpeg => decode_jpeg(data, width, height),
    }
}

fn size_error(format: PixelFormat, width: u32, height: u32, expected: usize, actual: usize) -> DecodeError {
    DecodeError::Size {
        format,
        width,
        height,
        expected,
        actual,
    }
}

#[cfg(feature = "fast-jpeg")]
fn decode_jpeg(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;
    expand_decoded(pixels, width, height)
}

#[cfg(not(feature = "fast-jpeg"))]
fn decode_jpeg(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;
    expand_decoded(pixels, width, height)
}

/// Decoders hand back either RGB or single-channel luma
fn expand_decoded(pixels: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    let px = width as usize * height as usize;
    if pixels.len() == px * 3 {
        Ok(pixels)
    } else if pixels.len() == px {
        Ok(pixels.iter().flat_map(|&l| [l, l, l]).collect())
    } else {
        Err(size_error(PixelFormat::Mjpeg, width, height, px * 3, pixels.len()))
    }
}

fn bgr_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let len = width as usize * height as usize * 3;
    let mut rgb = Vec::with_capacity(len);
    for px in data[..len].chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let px = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(px * 3);
    for quad in data[..px * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma) = data.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let uv = (y / 2) * w + (x / 2) * 2;
            let (u, v) = match chroma.get(uv..uv + 2) {
                Some(pair) => (pair[0], pair[1]),
                None => (128, 128),
            };
            rgb.extend_from_slice(&yuv_to_rgb(luma[y * w + x], u, v));
        }
    }
    rgb
}

/// BT.601 studio-range YCbCr to RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}

/// BT.601 RGB to studio-range YCbCr
#[inline]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    [
        (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8,
        (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8,
        (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8,
    ]
}
