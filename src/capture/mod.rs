pub mod backend;
pub mod decoder;
pub mod frame;
pub mod mjpeg_file;
pub mod source;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;

pub use backend::{BackendFactory, CaptureBackend, DeviceFactory, ReadOutcome, ResolvedSource, SourceSpec};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::FrameSource;
#[cfg(feature = "v4l2-capture")]
pub use v4l2::V4l2Capture;
