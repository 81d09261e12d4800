//! Conversion of device buffers to packed RGB24

use image::RgbImage;

use super::frame::PixelFormat;
use crate::error::CaptureError;

pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<RgbImage, CaptureError> {
    match format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 => packed(data, width, height),
        PixelFormat::Bgr24 => {
            let mut img = packed(data, width, height)?;
            for px in img.pixels_mut() {
                px.0.swap(0, 2);
            }
            Ok(img)
        }
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height),
    }
}

fn packed(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let len = width as usize * height as usize * 3;
    if data.len() < len {
        return Err(CaptureError::Decode(format!(
            "buffer holds {} bytes, {}x{} RGB needs {}",
            data.len(),
            width,
            height,
            len
        )));
    }
    RgbImage::from_raw(width, height, data[..len].to_vec())
        .ok_or_else(|| CaptureError::Decode("bad RGB buffer".into()))
}

/// Decode one JPEG image to RGB24
#[cfg(feature = "fast-jpeg")]
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| CaptureError::Decode("JPEG without dimensions".into()))?;
    expand_to_rgb(pixels, w as u32, h as u32)
}

/// Decode one JPEG image to RGB24
#[cfg(not(feature = "fast-jpeg"))]
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| CaptureError::Decode("JPEG without header".into()))?;
    expand_to_rgb(pixels, info.width as u32, info.height as u32)
}

/// Normalize gray, RGB or 4-channel decoder output to RGB24
fn expand_to_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let count = width as usize * height as usize;
    let rgb = match pixels.len() / count.max(1) {
        1 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        3 => pixels,
        4 => pixels
            .chunks_exact(4)
            .flat_map(|c| [c[0], c[1], c[2]])
            .collect(),
        _ => {
            return Err(CaptureError::Decode(format!(
                "unexpected decoded size {} for {}x{}",
                pixels.len(),
                width,
                height
            )))
        }
    };
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| CaptureError::Decode("decoded buffer too small".into()))
}

/// BT.601 limited-range YUYV (YUY2) to RGB24
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let needed = width as usize * height as usize * 2;
    if width % 2 != 0 || data.len() < needed {
        return Err(CaptureError::Decode(format!(
            "YUYV buffer of {} bytes does not fit {}x{}",
            data.len(),
            width,
            height
        )));
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in data[..needed].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| CaptureError::Decode("YUYV conversion size mismatch".into()))
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, Rgb};

    #[test]
    fn yuyv_white_and_black() {
        // white pixel pair, then black pixel pair
        let data = [235, 128, 235, 128, 16, 128, 16, 128];
        let img = yuyv_to_rgb(&data, 2, 2).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([255, 255, 255]));
        assert_eq!(img.get_pixel(0, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn yuyv_rejects_short_buffer() {
        assert!(yuyv_to_rgb(&[0; 6], 2, 2).is_err());
    }

    #[test]
    fn bgr_is_swapped() {
        let img = decode_frame(&[1, 2, 3], PixelFormat::Bgr24, 1, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([3, 2, 1]));
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let src = RgbImage::from_pixel(16, 8, Rgb([200, 40, 40]));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 95)
            .encode(src.as_raw(), 16, 8, ExtendedColorType::Rgb8)
            .unwrap();

        let img = decode_jpeg(&buf).unwrap();
        assert_eq!(img.dimensions(), (16, 8));
        let px = img.get_pixel(8, 4);
        assert!(px[0] > 180 && px[1] < 70, "unexpected color {px:?}");
    }
}
