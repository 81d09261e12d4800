//! Overlay compositing and letterbox geometry

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::capture::Frame;
use crate::inference::Overlay;

/// Where an image of one size lands inside a view of another, aspect preserved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

impl Letterbox {
    pub fn fit((src_w, src_h): (u32, u32), (dst_w, dst_h): (u32, u32)) -> Self {
        if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
            return Self {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
                scale: 0.0,
            };
        }
        let scale = (dst_w as f64 / src_w as f64).min(dst_h as f64 / src_h as f64);
        let width = ((src_w as f64 * scale).round() as u32).clamp(1, dst_w);
        let height = ((src_h as f64 * scale).round() as u32).clamp(1, dst_h);
        Self {
            x: (dst_w - width) / 2,
            y: (dst_h - height) / 2,
            width,
            height,
            scale,
        }
    }

    /// Map a point in view coordinates back to image pixels; `None` on the bars
    pub fn to_image(&self, vx: f64, vy: f64) -> Option<(u32, u32)> {
        if self.scale <= 0.0 {
            return None;
        }
        let lx = vx - self.x as f64;
        let ly = vy - self.y as f64;
        if lx < 0.0 || ly < 0.0 || lx >= self.width as f64 || ly >= self.height as f64 {
            return None;
        }
        Some(((lx / self.scale) as u32, (ly / self.scale) as u32))
    }
}

/// Blend `overlay` onto `frame`. The overlay is stretched to the frame first.
pub fn composite(frame: &Frame, overlay: Option<&Overlay>, opacity: f32) -> Option<RgbImage> {
    let mut base = frame.to_rgb_image()?;
    let Some(overlay) = overlay else {
        return Some(base);
    };

    let mut layer = overlay.to_rgba_image()?;
    if layer.dimensions() != base.dimensions() {
        layer = imageops::resize(&layer, base.width(), base.height(), FilterType::Triangle);
    }

    let opacity = if opacity.is_finite() { opacity.clamp(0.0, 1.0) } else { 0.0 };
    for (dst, src) in base.pixels_mut().zip(layer.pixels()) {
        let a = src[3] as f32 / 255.0 * opacity;
        if a <= 0.0 {
            continue;
        }
        let blend = |d: u8, s: u8| (d as f32 * (1.0 - a) + s as f32 * a).round() as u8;
        *dst = Rgb([blend(dst[0], src[0]), blend(dst[1], src[1]), blend(dst[2], src[2])]);
    }
    Some(base)
}

/// Scale `image` into a black canvas of `view` size
pub fn letterbox(image: &RgbImage, view: (u32, u32)) -> RgbImage {
    let fit = Letterbox::fit(image.dimensions(), view);
    let mut canvas = RgbImage::new(view.0, view.1);
    if fit.width > 0 && fit.height > 0 {
        let scaled = imageops::resize(image, fit.width, fit.height, FilterType::Triangle);
        imageops::replace(&mut canvas, &scaled, fit.x as i64, fit.y as i64);
    }
    canvas
}
