//! V4L2 camera capture with memory-mapped buffers

use std::io;
use std::time::Duration;

use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CaptureBackend, ReadOutcome};
use super::decoder;
use super::frame::PixelFormat;
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Live camera at `/dev/video<index>`
pub struct V4l2Capture {
    // Declared before the device so buffers are unmapped first
    stream: MmapStream<'static>,
    _device: Box<Device>,
    index: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Capture {
    /// Open the camera, negotiating MJPEG first and YUYV second
    pub fn open(index: u32, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let path = format!("/dev/video{index}");
        info!("Opening V4L2 camera: {}", path);

        let device = Device::with_path(&path)
            .map_err(|e| CaptureError::SourceUnavailable(format!("{path}: {e}")))?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::SourceUnavailable(format!(
                "{path} doesn't support video capture"
            )));
        }

        let (format, width, height) = Self::negotiate(&device, config)?;
        info!("Negotiated {:?} {}x{}", format, width, height);

        if config.fps > 0.0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(config.fps.round() as u32)) {
                debug!("Camera refused frame rate {}: {}", config.fps, e);
            }
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count.max(1))?;
        stream.set_timeout(config.read_timeout());

        info!(
            "Capture stream started with {} buffers",
            config.buffer_count.max(1)
        );

        Ok(Self {
            stream,
            _device: Box::new(device),
            index,
            width,
            height,
            format,
        })
    }

    fn negotiate(
        device: &Device,
        config: &CaptureConfig,
    ) -> Result<(PixelFormat, u32, u32), CaptureError> {
        for (fourcc, format) in [
            (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
            (FourCC::new(b"YUYV"), PixelFormat::Yuyv4),
        ] {
            let mut fmt = device.format()?;
            fmt.width = config.width;
            fmt.height = config.height;
            fmt.fourcc = fourcc;

            let actual = device.set_format(&fmt)?;
            if actual.fourcc == fourcc {
                return Ok((format, actual.width, actual.height));
            }
            debug!("Camera rejected {}, got {}", fourcc, actual.fourcc);
        }
        Err(CaptureError::UnsupportedSource(
            "camera offers neither MJPEG nor YUYV".into(),
        ))
    }
}

impl CaptureBackend for V4l2Capture {
    #[instrument(skip(self), fields(camera = self.index))]
    fn read(&mut self) -> Result<ReadOutcome, CaptureError> {
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CaptureError::Read("dequeue timed out".into()))
            }
            Err(e) => return Err(CaptureError::Read(e.to_string())),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };
        let image = decoder::decode_frame(data, self.format, self.width, self.height)?;

        let timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
            + Duration::from_micros(meta.timestamp.usec.max(0) as u64);

        Ok(ReadOutcome::Frame {
            image,
            timestamp: Some(timestamp),
        })
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::UnsupportedSource(
            "live cameras cannot rewind".into(),
        ))
    }
}
