//! Model seam and the deterministic edge fallback

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::output::{ModelOutput, OutputTensor};
use crate::error::InferenceError;

/// Normalized NCHW input (batch of one, three channels, values in [0, 1])
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl InputTensor {
    /// Bilinear resize to the model's input size, then scale to [0, 1] planar RGB
    pub fn from_rgb(image: &RgbImage, (width, height): (u32, u32)) -> Self {
        let resized;
        let image = if image.dimensions() == (width, height) {
            image
        } else {
            resized = imageops::resize(image, width, height, FilterType::Triangle);
            &resized
        };

        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (i, px) in image.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = px[c] as f32 / 255.0;
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, 3, self.height as usize, self.width as usize]
    }

    /// Rec.601 luma at (x, y)
    fn luma(&self, x: u32, y: u32) -> f32 {
        let plane = (self.width * self.height) as usize;
        let i = (y * self.width + x) as usize;
        0.299 * self.data[i] + 0.587 * self.data[plane + i] + 0.114 * self.data[2 * plane + i]
    }
}

/// A segmentation model. Owned by the inference thread only.
pub trait Segmenter: Send {
    /// (width, height) the model expects
    fn input_size(&self) -> (u32, u32);

    fn forward(&mut self, input: &InputTensor) -> Result<ModelOutput, InferenceError>;

    fn name(&self) -> &str {
        "segmenter"
    }
}

/// Sobel edge magnitude, normalized to the frame's strongest edge.
/// Stands in for the model when none could be loaded.
#[derive(Debug, Clone)]
pub struct EdgeFallback {
    input_size: (u32, u32),
}

impl EdgeFallback {
    pub fn new(input_size: (u32, u32)) -> Self {
        Self { input_size }
    }
}

impl Segmenter for EdgeFallback {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn forward(&mut self, input: &InputTensor) -> Result<ModelOutput, InferenceError> {
        let (w, h) = (input.width, input.height);
        let mut magnitude = vec![0.0f32; (w * h) as usize];

        if w >= 3 && h >= 3 {
            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    let l = |dx: i32, dy: i32| {
                        input.luma((x as i32 + dx) as u32, (y as i32 + dy) as u32)
                    };
                    let gx = (l(1, -1) + 2.0 * l(1, 0) + l(1, 1))
                        - (l(-1, -1) + 2.0 * l(-1, 0) + l(-1, 1));
                    let gy = (l(-1, 1) + 2.0 * l(0, 1) + l(1, 1))
                        - (l(-1, -1) + 2.0 * l(0, -1) + l(1, -1));
                    magnitude[(y * w + x) as usize] = (gx * gx + gy * gy).sqrt();
                }
            }
        }

        let peak = magnitude.iter().cloned().fold(0.0f32, f32::max);
        if peak > 0.0 {
            for m in &mut magnitude {
                *m /= peak;
            }
        }

        let tensor = OutputTensor::new(vec![1, 1, h as usize, w as usize], magnitude)?;
        Ok(ModelOutput::Tensor(tensor))
    }

    fn name(&self) -> &str {
        "edge-fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn input_is_planar_and_normalized() {
        let img = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });
        let input = InputTensor::from_rgb(&img, (2, 1));
        assert_eq!(input.shape(), [1, 3, 1, 2]);
        assert_eq!(input.data, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn input_is_resized() {
        let img = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let input = InputTensor::from_rgb(&img, (16, 16));
        assert_eq!(input.data.len(), 3 * 16 * 16);
    }

    #[test]
    fn fallback_highlights_edges_only() {
        // left half black, right half white
        let img = RgbImage::from_fn(8, 8, |x, _| if x < 4 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let mut fallback = EdgeFallback::new((8, 8));
        let input = InputTensor::from_rgb(&img, fallback.input_size());

        let ModelOutput::Tensor(t) = fallback.forward(&input).unwrap() else {
            panic!("fallback returns a single tensor");
        };
        assert_eq!(t.shape, vec![1, 1, 8, 8]);
        let at = |x: usize, y: usize| t.data[y * 8 + x];
        assert_eq!(at(1, 4), 0.0);
        assert_eq!(at(6, 4), 0.0);
        assert!((at(3, 4) - 1.0).abs() < 1e-6);
        assert!((at(4, 4) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fallback_is_deterministic_on_flat_input() {
        let img = RgbImage::from_pixel(5, 5, Rgb([90, 90, 90]));
        let mut fallback = EdgeFallback::new((5, 5));
        let input = InputTensor::from_rgb(&img, (5, 5));
        let ModelOutput::Tensor(t) = fallback.forward(&input).unwrap() else {
            panic!("fallback returns a single tensor");
        };
        assert!(t.data.iter().all(|&v| v == 0.0));
    }
}
