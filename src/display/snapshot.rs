//! Headless surface that keeps the latest composited image for screenshots

use std::path::{Path, PathBuf};

use chrono::Local;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::compose::{composite, letterbox};
use super::DisplaySurface;
use crate::capture::Frame;
use crate::inference::Overlay;

#[derive(Debug, Default)]
pub struct SnapshotSurface {
    /// Letterbox into this view size instead of keeping the frame size
    view: Option<(u32, u32)>,
    last: Option<RgbImage>,
    last_frame_id: Option<u64>,
    last_had_overlay: bool,
    pub frames_shown: u64,
    pub pairs_shown: u64,
    pub connected: bool,
    pub finished: bool,
    pub signal_blank: bool,
    pub errors: Vec<String>,
}

impl SnapshotSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(view: (u32, u32)) -> Self {
        Self {
            view: Some(view),
            ..Self::default()
        }
    }

    pub fn last_image(&self) -> Option<&RgbImage> {
        self.last.as_ref()
    }

    /// Id of the frame currently shown, and whether it carried an overlay
    pub fn showing(&self) -> Option<(u64, bool)> {
        self.last_frame_id.map(|id| (id, self.last_had_overlay))
    }

    /// Write the current image as PNG
    pub fn save_screenshot(&self, path: &Path) -> Result<()> {
        let image = self
            .last
            .as_ref()
            .ok_or_else(|| eyre!("nothing displayed yet"))?;
        image
            .save_with_format(path, image::ImageFormat::Png)
            .wrap_err_with(|| format!("saving screenshot to {}", path.display()))?;
        info!("Screenshot saved to {}", path.display());
        Ok(())
    }

    /// Save into `dir` under a timestamped name
    pub fn save_screenshot_in(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("creating {}", dir.display()))?;
        let name = format!("screenshot_{}.png", Local::now().format("%Y%m%d_%H%M%S_%3f"));
        let path = dir.join(name);
        self.save_screenshot(&path)?;
        Ok(path)
    }

    fn show(&mut self, frame: &Frame, overlay: Option<&Overlay>, opacity: f32) {
        let Some(image) = composite(frame, overlay, opacity) else {
            warn!("Frame {} has inconsistent dimensions, not shown", frame.id());
            return;
        };
        self.last = Some(match self.view {
            Some(view) => letterbox(&image, view),
            None => image,
        });
        self.last_frame_id = Some(frame.id());
        self.last_had_overlay = overlay.is_some();
    }
}

impl DisplaySurface for SnapshotSurface {
    fn on_frame_ready(&mut self, frame: &Frame) {
        self.show(frame, None, 0.0);
        self.frames_shown += 1;
    }

    fn on_pair_ready(&mut self, frame: &Frame, overlay: &Overlay, opacity: f32) {
        self.show(frame, Some(overlay), opacity);
        self.pairs_shown += 1;
    }

    fn on_connectivity_changed(&mut self, connected: bool) {
        if connected {
            info!("Video source connected");
        } else {
            warn!("Video source disconnected");
        }
        self.connected = connected;
    }

    fn on_stream_finished(&mut self) {
        info!("Video finished");
        self.finished = true;
    }

    fn on_error(&mut self, message: &str) {
        error!("{}", message);
        self.errors.push(message.to_string());
    }

    fn on_debug(&mut self, message: &str) {
        debug!("{}", message);
    }

    fn on_signal_blank(&mut self, blank: bool) {
        if blank {
            warn!("No video signal (black frames)");
        }
        self.signal_blank = blank;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};

    #[test]
    fn pair_is_composited_and_saved() {
        let mut surface = SnapshotSurface::new();
        let frame = Frame::new(3, RgbImage::from_pixel(6, 4, Rgb([0, 0, 0])));
        let overlay = Overlay::from_image(3, RgbaImage::from_pixel(6, 4, Rgba([255, 0, 0, 255])));
        surface.on_pair_ready(&frame, &overlay, 1.0);

        assert_eq!(surface.showing(), Some((3, true)));
        assert_eq!(*surface.last_image().unwrap().get_pixel(0, 0), Rgb([255, 0, 0]));

        let dir = tempfile::tempdir().unwrap();
        let path = surface.save_screenshot_in(dir.path()).unwrap();
        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (6, 4));
        assert_eq!(*saved.get_pixel(5, 3), Rgb([255, 0, 0]));
    }

    #[test]
    fn screenshot_without_content_fails() {
        let surface = SnapshotSurface::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(surface.save_screenshot(&dir.path().join("x.png")).is_err());
    }

    #[test]
    fn view_letterboxes() {
        let mut surface = SnapshotSurface::with_view((8, 8));
        surface.on_frame_ready(&Frame::new(1, RgbImage::from_pixel(8, 4, Rgb([9, 9, 9]))));
        assert_eq!(surface.last_image().unwrap().dimensions(), (8, 8));
        assert_eq!(surface.showing(), Some((1, false)));
    }
}
