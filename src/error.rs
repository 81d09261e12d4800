//! Error taxonomy for capture, inference and configuration

use thiserror::Error;

/// Failures raised while opening or reading a video source
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no camera available; choose a video file instead")]
    NoCameraAvailable,

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("frame read failed: {0}")]
    Read(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised by the inference engine or the model behind it
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("an inference request is already in flight")]
    EngineBusy,

    #[error("inference engine is stopped")]
    EngineStopped,

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("forward pass failed: {0}")]
    Forward(String),

    #[error("unusable model output: {0}")]
    Output(String),

    #[error("shape mismatch: {0}")]
    Shape(String),
}

/// Failures parsing configuration values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid color {0:?}: expected r,g,b[,a] or #RRGGBB[AA]")]
    Color(String),

    #[error("invalid size {0:?}: expected W,H")]
    Size(String),

    #[error("invalid device {0:?}: expected cpu or cuda")]
    Device(String),
}
