//! Probability maps to colorized RGBA overlays

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{Rgba as RgbaPixel, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::OverlayConfig;

/// Overlay highlight color. Parses `r,g,b`, `r,g,b,a`, `#RRGGBB` and `#RRGGBBAA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl FromStr for Rgba {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Color(s.to_string());
        let t = s.trim();

        if let Some(hex) = t.strip_prefix('#') {
            let byte = |i: usize| {
                hex.get(i..i + 2)
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(bad)
            };
            return match hex.len() {
                6 => Ok(Rgba::new(byte(0)?, byte(2)?, byte(4)?, 255)),
                8 => Ok(Rgba::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
                _ => Err(bad()),
            };
        }

        let parts = t
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| bad())?;
        match parts.as_slice() {
            [r, g, b] => Ok(Rgba::new(*r, *g, *b, 255)),
            [r, g, b, a] => Ok(Rgba::new(*r, *g, *b, *a)),
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for Rgba {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Rgba> for String {
    fn from(c: Rgba) -> String {
        c.to_string()
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.r, self.g, self.b, self.a)
    }
}

/// Segmentation result for exactly one frame
#[derive(Clone)]
pub struct Overlay {
    pub frame_id: u64,
    /// Packed RGBA rows, `width * height * 4` bytes
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Overlay {
    pub fn from_image(frame_id: u64, image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            frame_id,
            pixels: Bytes::from(image.into_raw()),
            width,
            height,
        }
    }

    /// Fully transparent overlay, produced while the feature is disabled
    pub fn transparent(frame_id: u64, width: u32, height: u32) -> Self {
        Self {
            frame_id,
            pixels: Bytes::from(vec![0u8; width as usize * height as usize * 4]),
            width,
            height,
        }
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec())
    }

    pub fn is_transparent(&self) -> bool {
        self.pixels.chunks_exact(4).all(|px| px[3] == 0)
    }
}

impl fmt::Debug for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlay")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Live-tunable shaping parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub color: Rgba,
    pub threshold: f32,
    pub gamma: f32,
    pub match_frame_size: bool,
}

impl From<&OverlayConfig> for OverlayStyle {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            color: config.color,
            threshold: config.threshold,
            gamma: config.gamma,
            match_frame_size: config.match_frame_size,
        }
    }
}

impl OverlayStyle {
    /// Map a probability to an alpha value: cut below the threshold, renormalize
    /// the rest to [0, 1], bend by `1/gamma`, then scale by the color's alpha.
    pub fn alpha(&self, p: f32) -> u8 {
        let mut p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let thr = self.threshold;
        if thr > 0.0 {
            p = ((p - thr) / (1.0 - thr).max(1e-6)).clamp(0.0, 1.0);
        }
        if (self.gamma - 1.0).abs() > 1e-6 && self.gamma > 0.0 {
            p = p.powf(1.0 / self.gamma);
        }
        let alpha = (p * 255.0) as u32;
        (alpha * self.color.a as u32 / 255) as u8
    }

    pub fn colorize(&self, prob: &ProbabilityMap) -> RgbaImage {
        let Rgba { r, g, b, .. } = self.color;
        RgbaImage::from_fn(prob.width, prob.height, |x, y| {
            RgbaPixel([r, g, b, self.alpha(prob.get(x, y))])
        })
    }
}

/// Per-pixel foreground probabilities in [0, 1], row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ProbabilityMap {
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Colorize and, when requested, scale to the frame's size
pub fn build_overlay(
    frame_id: u64,
    prob: &ProbabilityMap,
    style: &OverlayStyle,
    frame_size: (u32, u32),
) -> Overlay {
    let mut image = style.colorize(prob);
    if style.match_frame_size && image.dimensions() != frame_size {
        image = imageops::resize(&image, frame_size.0, frame_size.1, FilterType::Triangle);
    }
    Overlay::from_image(frame_id, image)
}
