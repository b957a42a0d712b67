//! Paint surface
//!
//! Frames are converted to RGBA and scaled to the surface size on paint.
//! The worker owns the drawing; the controlling side keeps a
//! [`SharedSurface`] handle to read snapshots.

use crate::frame_queue::VideoFrame;
use crate::pixel_convert::{ColorSpace, YuvToRgba};
use image::{ImageFormat, RgbaImage};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Frame {width}x{height} has truncated planes")]
    InvalidFrame { width: u32, height: u32 },
    #[error("Surface has zero size")]
    Empty,
    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Axis-aligned rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

pub trait Surface: Send {
    fn resize(&mut self, width: u32, height: u32);

    fn size(&self) -> (u32, u32);

    /// Draw `frame` scaled to fill the surface
    fn draw_frame(&mut self, frame: &VideoFrame) -> Result<(), SurfaceError>;

    /// Outline `rect`; parts outside the surface are clipped
    fn stroke_rect(&mut self, rect: Rect, color: [u8; 4], thickness: u32);

    /// Fill `rect`, clipped like [`Surface::stroke_rect`]
    fn fill_rect(&mut self, rect: Rect, color: [u8; 4]);

    fn snapshot(&self) -> RgbaImage;
}

// ============================================================================
// RGBA surface
// ============================================================================

pub struct RgbaSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    converter: YuvToRgba,
    frames_drawn: u64,
    last_timestamp_us: Option<i64>,
}

impl RgbaSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
            converter: YuvToRgba::new(ColorSpace::for_resolution(width, height)),
            frames_drawn: 0,
            last_timestamp_us: None,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    /// Timestamp of the frame currently on the surface
    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.last_timestamp_us
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[idx..idx + 4]);
        Some(px)
    }

    /// `rect` clipped to the surface as `(x0, x1, y0, y1)`, `None` when empty
    fn clip(&self, rect: Rect) -> Option<(u32, u32, u32, u32)> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let max_x = self.width as f32;
        let max_y = self.height as f32;
        let x0 = rect.x0.min(rect.x1).clamp(0.0, max_x) as u32;
        let x1 = rect.x0.max(rect.x1).clamp(0.0, max_x) as u32;
        let y0 = rect.y0.min(rect.y1).clamp(0.0, max_y) as u32;
        let y1 = rect.y0.max(rect.y1).clamp(0.0, max_y) as u32;
        (x0 < x1 && y0 < y1).then_some((x0, x1, y0, y1))
    }

    fn fill_span(&mut self, x0: u32, x1: u32, y: u32, color: [u8; 4]) {
        let row = y as usize * self.width as usize;
        for x in x0..x1 {
            let idx = (row + x as usize) * 4;
            self.pixels[idx..idx + 4].copy_from_slice(&color);
        }
    }
}

impl Surface for RgbaSurface {
    fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        tracing::debug!("surface resized {}x{} -> {}x{}", self.width, self.height, width, height);
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 4];
        self.converter = YuvToRgba::new(ColorSpace::for_resolution(width, height));
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn draw_frame(&mut self, frame: &VideoFrame) -> Result<(), SurfaceError> {
        if self.width == 0 || self.height == 0 {
            return Err(SurfaceError::Empty);
        }
        let invalid = || SurfaceError::InvalidFrame {
            width: frame.width(),
            height: frame.height(),
        };
        let planes = frame.planes().ok_or_else(invalid)?;

        let converted = self.converter.convert_scaled(
            planes,
            frame.width() as usize,
            frame.height() as usize,
            &mut self.pixels,
            self.width as usize,
            self.height as usize,
        );
        if !converted {
            return Err(invalid());
        }

        self.frames_drawn += 1;
        self.last_timestamp_us = Some(frame.timestamp_us());
        Ok(())
    }

    fn stroke_rect(&mut self, rect: Rect, color: [u8; 4], thickness: u32) {
        let Some((x0, x1, y0, y1)) = self.clip(rect) else {
            return;
        };
        let t = thickness.max(1);

        for y in y0..y1 {
            if y < y0 + t || y + t >= y1 {
                self.fill_span(x0, x1, y, color);
            } else {
                self.fill_span(x0, (x0 + t).min(x1), y, color);
                self.fill_span(x1.saturating_sub(t).max(x0), x1, y, color);
            }
        }
    }

    fn fill_rect(&mut self, rect: Rect, color: [u8; 4]) {
        let Some((x0, x1, y0, y1)) = self.clip(rect) else {
            return;
        };
        for y in y0..y1 {
            self.fill_span(x0, x1, y, color);
        }
    }

    fn snapshot(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }
}

// ============================================================================
// Shared handle
// ============================================================================

/// Surface shared between the worker (painting) and its owner (snapshots)
#[derive(Clone)]
pub struct SharedSurface(Arc<Mutex<RgbaSurface>>);

impl SharedSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self(Arc::new(Mutex::new(RgbaSurface::new(width, height))))
    }

    pub fn frames_drawn(&self) -> u64 {
        self.0.lock().frames_drawn()
    }

    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.0.lock().last_timestamp_us()
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), SurfaceError> {
        let image = self.snapshot();
        image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

impl Surface for SharedSurface {
    fn resize(&mut self, width: u32, height: u32) {
        self.0.lock().resize(width, height)
    }

    fn size(&self) -> (u32, u32) {
        self.0.lock().size()
    }

    fn draw_frame(&mut self, frame: &VideoFrame) -> Result<(), SurfaceError> {
        self.0.lock().draw_frame(frame)
    }

    fn stroke_rect(&mut self, rect: Rect, color: [u8; 4], thickness: u32) {
        self.0.lock().stroke_rect(rect, color, thickness)
    }

    fn fill_rect(&mut self, rect: Rect, color: [u8; 4]) {
        self.0.lock().fill_rect(rect, color)
    }

    fn snapshot(&self) -> RgbaImage {
        self.0.lock().snapshot()
    }
}

impl fmt::Debug for SharedSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("SharedSurface")
            .field("width", &width)
            .field("height", &height)
            .finish()
    }
}

// ============================================================================
// Text
// ============================================================================

/// Glyph cell at scale 1, without the one pixel gap between glyphs
pub const GLYPH_WIDTH: u32 = 3;
pub const GLYPH_HEIGHT: u32 = 5;

/// 3x5 glyph rows, top first, leftmost pixel in bit 2
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        ' ' | '_' => [0; 5],
        _ => [0b110, 0b001, 0b010, 0b000, 0b010],
    }
}

/// Pixel width of `text` drawn at `scale`
pub fn text_width(text: &str, scale: u32) -> u32 {
    let glyphs = text.chars().count() as u32;
    (glyphs * (GLYPH_WIDTH + 1)).saturating_sub(1) * scale.max(1)
}

/// Draw `text` with its top-left corner at `(x, y)`, `scale` pixels per dot
pub fn draw_text<S: Surface + ?Sized>(surface: &mut S, x: f32, y: f32, text: &str, color: [u8; 4], scale: u32) {
    let scale = scale.max(1) as f32;
    for (i, c) in text.chars().enumerate() {
        let left = x + i as f32 * (GLYPH_WIDTH + 1) as f32 * scale;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                let x0 = left + col as f32 * scale;
                let y0 = y + row as f32 * scale;
                surface.fill_rect(
                    Rect {
                        x0,
                        y0,
                        x1: x0 + scale,
                        y1: y0 + scale,
                    },
                    color,
                );
            }
        }
    }
}

/// Encode a surface snapshot as baseline JPEG
pub fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, SurfaceError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(SurfaceError::Empty);
    }
    let rgb = image::DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut jpeg = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&rgb)?;
    Ok(jpeg)
}
