use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Captured RGB frame. Immutable; clones share the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB24 rows, `width * height * 3` bytes
    pub pixels: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub captured_at: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Starts at 1 and increases by one per captured frame
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub source_timestamp: Option<Duration>, // Device or stream position if available
}

/// Pixel formats negotiated with capture devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

/// Channel value at or below which a sample counts as black
pub const BLANK_THRESHOLD: u8 = 12;

impl Frame {
    pub fn new(frame_id: u64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::from_raw(frame_id, width, height, image.into_raw())
    }

    pub fn from_raw(frame_id: u64, width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            pixels: pixels.into(),
            meta: Arc::new(FrameMetadata {
                frame_id,
                width,
                height,
                stride: width * 3,
                source_timestamp: None,
            }),
            captured_at: Instant::now(),
        }
    }

    pub fn with_source_timestamp(mut self, ts: Option<Duration>) -> Self {
        Arc::make_mut(&mut self.meta).source_timestamp = ts;
        self
    }

    pub fn id(&self) -> u64 {
        self.meta.frame_id
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    /// Copy out as an `image` buffer
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width(), self.height(), self.pixels.to_vec())
    }

    fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let offset = (y as usize) * (self.meta.stride as usize) + (x as usize) * 3;
        self.pixels
            .get(offset..offset + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// True when the center and four cross samples are all near black.
    /// Empty or truncated frames count as blank.
    pub fn is_blank(&self, threshold: u8) -> bool {
        let (w, h) = (self.width(), self.height());
        if w == 0 || h == 0 {
            return true;
        }
        let samples = [
            (w / 2, h / 2),
            (w / 4, h / 2),
            (3 * w / 4, h / 2),
            (w / 2, h / 4),
            (w / 2, 3 * h / 4),
        ];
        samples.iter().all(|&(x, y)| match self.pixel(x, y) {
            Some(rgb) => rgb.iter().all(|&c| c <= threshold),
            None => true,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.meta.frame_id)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn blank_detection_samples_cross() {
        let black = Frame::new(1, RgbImage::from_pixel(40, 30, Rgb([5, 5, 5])));
        assert!(black.is_blank(BLANK_THRESHOLD));

        let mut img = RgbImage::from_pixel(40, 30, Rgb([0, 0, 0]));
        img.put_pixel(30, 15, Rgb([0, 40, 0])); // 3w/4, h/2
        assert!(!Frame::new(2, img).is_blank(BLANK_THRESHOLD));

        // A bright corner is outside the sampled points
        let mut img = RgbImage::from_pixel(40, 30, Rgb([0, 0, 0]));
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        assert!(Frame::new(3, img).is_blank(BLANK_THRESHOLD));
    }

    #[test]
    fn clones_share_pixels() {
        let frame = Frame::new(7, RgbImage::from_pixel(4, 2, Rgb([1, 2, 3])));
        let copy = frame.clone();
        assert_eq!(copy.id(), 7);
        assert_eq!(copy.pixels.as_ptr(), frame.pixels.as_ptr());
        assert_eq!(frame.to_rgb_image().unwrap().get_pixel(3, 1), &Rgb([1, 2, 3]));
    }
}
