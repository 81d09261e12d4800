//! Motion-JPEG files: concatenated JPEG images, memory-mapped and indexed at open

use std::fs::File;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use super::backend::{CaptureBackend, ReadOutcome};
use super::decoder;
use crate::error::CaptureError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub fn is_mjpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mjpg") || e.eq_ignore_ascii_case("mjpeg"))
        .unwrap_or(false)
}

pub struct MjpegFile {
    map: Mmap,
    frames: Vec<Range<usize>>,
    position: usize,
}

impl MjpegFile {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{}: {e}", path.display())))?;
        // SAFETY: the map is read-only; a file truncated underneath us is not supported
        let map = unsafe { Mmap::map(&file)? };

        let frames = index_frames(&map);
        if frames.is_empty() {
            return Err(CaptureError::SourceUnavailable(format!(
                "{}: no JPEG images found",
                path.display()
            )));
        }
        info!("Opened {} ({} frames)", path.display(), frames.len());

        Ok(Self {
            map,
            frames,
            position: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl CaptureBackend for MjpegFile {
    fn read(&mut self) -> Result<ReadOutcome, CaptureError> {
        let Some(range) = self.frames.get(self.position).cloned() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        self.position += 1;
        let image = decoder::decode_jpeg(&self.map[range])?;
        Ok(ReadOutcome::Frame {
            image,
            timestamp: None,
        })
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.position = 0;
        Ok(())
    }
}

/// Byte ranges of each SOI..=EOI image. Markers nest, so an EXIF thumbnail
/// (its own SOI..EOI inside APP1) stays part of the enclosing image.
fn index_frames(data: &[u8]) -> Vec<Range<usize>> {
    let mut frames = Vec::new();
    let mut cursor = 0;
    'images: while let Some(start) = find(data, cursor, SOI) {
        let mut depth = 1usize;
        let mut at = start + 2;
        while depth > 0 {
            let next_soi = find(data, at, SOI);
            let Some(end) = find(data, at, EOI) else {
                break 'images;
            };
            match next_soi {
                Some(soi) if soi < end => {
                    depth += 1;
                    at = soi + 2;
                }
                _ => {
                    depth -= 1;
                    at = end + 2;
                }
            }
        }
        frames.push(start..at);
        cursor = at;
    }
    frames
}

fn find(data: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_concatenated_images() {
        let data = [
            0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, // frame 1 at 1..7
            0xFF, 0xD8, 0xFF, 0xD9, // frame 2 at 7..11
            0xFF, 0xD8, 0x03, // truncated tail
        ];
        assert_eq!(index_frames(&data), vec![1..7, 7..11]);
    }

    #[test]
    fn embedded_thumbnail_stays_inside_its_image() {
        let data = [
            0xFF, 0xD8, 0xFF, 0xE1, // image SOI, APP1
            0xFF, 0xD8, 0x07, 0xFF, 0xD9, // thumbnail
            0x08, 0xFF, 0xD9, // image EOI, frame 1 at 0..12
            0xFF, 0xD8, 0x09, 0xFF, 0xD9, // frame 2 at 12..17
        ];
        assert_eq!(index_frames(&data), vec![0..12, 12..17]);
    }

    #[test]
    fn extension_detection() {
        assert!(is_mjpeg_path(Path::new("a/b.MJPG")));
        assert!(is_mjpeg_path(Path::new("clip.mjpeg")));
        assert!(!is_mjpeg_path(Path::new("clip.mp4")));
    }
}
