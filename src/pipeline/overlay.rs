//! Replay annotations drawn onto a copy of a buffered frame

use image::{Rgb, RgbImage};

use crate::capture::{decoder, Frame, PixelFormat};
use crate::error::DecodeError;

const INDICATOR: Rgb<u8> = Rgb([255, 255, 0]);
const BADGE: Rgb<u8> = Rgb([24, 24, 24]);

/// 5x7 glyphs, one byte per row, high bit on the left
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const LABEL: [[u8; 7]; 6] = [
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001], // R
    [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111], // E
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000], // P
    [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111], // L
    [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001], // A
    [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100], // Y
];

/// Height of the progress bar along the bottom edge
pub fn progress_bar_height(height: u32) -> u32 {
    (height / 72).max(3).min(height)
}

/// Width of the progress bar after showing frame `position` of `total`
pub fn progress_width(width: u32, position: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let done = (position + 1).min(total) as u64;
    (width as u64 * done / total as u64) as u32
}

/// Copy `frame` as RGB24 with a "REPLAY" badge and a progress bar for
/// frame `position` of `total`. The source frame is left untouched.
pub fn annotate_replay(frame: &Frame, position: usize, total: usize) -> Result<Frame, DecodeError> {
    let (width, height) = (frame.width(), frame.height());
    let rgb = decoder::to_rgb(frame)?;
    let len = rgb.len();
    let mut img = RgbImage::from_raw(width, height, rgb).ok_or(DecodeError::Size {
        format: PixelFormat::Rgb24,
        width,
        height,
        expected: width as usize * height as usize * 3,
        actual: len,
    })?;

    draw_badge(&mut img);

    let bar_h = progress_bar_height(height);
    fill_rect(
        &mut img,
        0,
        height - bar_h,
        progress_width(width, position, total),
        bar_h,
        INDICATOR,
    );

    Ok(frame.derive(img.into_raw(), PixelFormat::Rgb24))
}

fn draw_badge(img: &mut RgbImage) {
    let scale = (img.height() / 120).max(1);
    let margin = (img.width() / 40).max(2);
    let pad = 2 * scale;
    let advance = (GLYPH_W + 1) * scale;
    let text_w = advance * LABEL.len() as u32 - scale;
    let text_h = GLYPH_H * scale;

    fill_rect(img, margin, margin, text_w + 2 * pad, text_h + 2 * pad, BADGE);

    for (i, glyph) in LABEL.iter().enumerate() {
        let gx = margin + pad + i as u32 * advance;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (1 << (GLYPH_W - 1 - col)) != 0 {
                    fill_rect(
                        img,
                        gx + col * scale,
                        margin + pad + row as u32 * scale,
                        scale,
                        scale,
                        INDICATOR,
                    );
                }
            }
        }
    }
}

/// Fill a rectangle, clipped to the image
fn fill_rect(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(w).min(img.width());
    let y_end = y.saturating_add(h).min(img.height());
    for py in y.min(y_end)..y_end {
        for px in x.min(x_end)..x_end {
            img.put_pixel(px, py, color);
        }
    }
}
