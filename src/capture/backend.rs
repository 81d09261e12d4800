//! Capture device seam: source specs, backends and the factory that opens them

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use image::RgbImage;
use tracing::debug;

use crate::error::CaptureError;
use crate::CaptureConfig;

/// What the operator asked to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Auto,
    Camera(u32),
    File(PathBuf),
}

impl FromStr for SourceSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(SourceSpec::Auto);
        }
        match s.parse::<u32>() {
            Ok(index) => Ok(SourceSpec::Camera(index)),
            Err(_) => Ok(SourceSpec::File(PathBuf::from(s))),
        }
    }
}

/// A concrete device or file after auto-detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Camera(u32),
    File(PathBuf),
}

impl ResolvedSource {
    pub fn is_file(&self) -> bool {
        matches!(self, ResolvedSource::File(_))
    }
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSource::Camera(index) => write!(f, "camera {index}"),
            ResolvedSource::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// Result of a single read
#[derive(Debug)]
pub enum ReadOutcome {
    Frame {
        image: RgbImage,
        timestamp: Option<Duration>,
    },
    EndOfStream,
}

/// An open capture device. Reads must return within the configured read timeout.
pub trait CaptureBackend: Send {
    fn read(&mut self) -> Result<ReadOutcome, CaptureError>;

    /// Seek back to the first frame
    fn rewind(&mut self) -> Result<(), CaptureError>;

    /// Native frame rate of a file, when the container declares one
    fn native_fps(&self) -> Option<f64> {
        None
    }
}

/// Opens backends for resolved sources
pub trait BackendFactory: Send + Sync {
    fn open(
        &self,
        source: &ResolvedSource,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError>;

    /// A camera counts as available when it opens and delivers one frame
    fn probe_camera(&self, index: u32, config: &CaptureConfig) -> bool {
        match self.open(&ResolvedSource::Camera(index), config) {
            Ok(mut backend) => matches!(backend.read(), Ok(ReadOutcome::Frame { .. })),
            Err(e) => {
                debug!("Camera {} not available: {}", index, e);
                false
            }
        }
    }
}

/// Opens real devices and files
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceFactory;

impl BackendFactory for DeviceFactory {
    fn open(
        &self,
        source: &ResolvedSource,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        match source {
            ResolvedSource::Camera(index) => open_camera(*index, config),
            ResolvedSource::File(path) => open_file(path, config),
        }
    }
}

#[cfg(feature = "v4l2-capture")]
fn open_camera(index: u32, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    let capture = super::v4l2::V4l2Capture::open(index, config)?;
    Ok(Box::new(capture))
}

#[cfg(not(feature = "v4l2-capture"))]
fn open_camera(index: u32, _config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Err(CaptureError::UnsupportedSource(format!(
        "camera {index}: built without v4l2-capture"
    )))
}

fn open_file(path: &Path, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    if !path.is_file() {
        return Err(CaptureError::SourceUnavailable(format!(
            "{} does not exist or is not a file",
            path.display()
        )));
    }

    if super::mjpeg_file::is_mjpeg_path(path) {
        return Ok(Box::new(super::mjpeg_file::MjpegFile::open(path)?));
    }

    open_container(path, config)
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_container(path: &Path, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    let capture = super::gst_capture::GstFileCapture::open(path, config.read_timeout())?;
    Ok(Box::new(capture))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_container(path: &Path, _config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Err(CaptureError::UnsupportedSource(format!(
        "{}: container playback needs the gstreamer-pipeline feature",
        path.display()
    )))
}
