use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::capture::{BackendFactory, ResolvedSource};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Container extensions considered when looking for a default video
pub const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "mov", "mkv", "avi", "webm", "mjpg", "mjpeg"];

/// Subdirectories searched after the media root itself
const MEDIA_SUBDIRS: [&str; 3] = ["videos", "data", "media"];

/// Auto-detect the best source: first working camera, else a default video file
pub fn auto_detect_source(
    factory: &dyn BackendFactory,
    config: &CaptureConfig,
) -> Result<ResolvedSource, CaptureError> {
    info!("Auto-detecting capture devices...");

    for index in 0..config.probe_count {
        if factory.probe_camera(index, config) {
            info!("Found camera {}", index);
            return Ok(ResolvedSource::Camera(index));
        }
    }

    if config.auto_file_fallback {
        let root = config
            .media_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        if let Some(file) = find_default_video_file(&root) {
            warn!("No camera found, falling back to {}", file.display());
            return Ok(ResolvedSource::File(file));
        }
    }

    Err(CaptureError::NoCameraAvailable)
}

/// First video file in `root`, then in its `videos/`, `data/` and `media/` subdirectories
pub fn find_default_video_file(root: &Path) -> Option<PathBuf> {
    std::iter::once(root.to_path_buf())
        .chain(MEDIA_SUBDIRS.iter().map(|d| root.join(d)))
        .filter(|dir| dir.is_dir())
        .find_map(|dir| videos_in(&dir).into_iter().next())
}

fn videos_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_video_file(p))
        .collect();
    files.sort();
    files
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}
