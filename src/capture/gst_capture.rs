//! GStreamer-based container playback (mp4, mkv, mov, ...) decoded to RGB

use std::path::Path;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, info};

use super::backend::{CaptureBackend, ReadOutcome};
use crate::error::CaptureError;

const PIPELINE: &str = "filesrc name=src ! decodebin ! videoconvert ! \
                        video/x-raw,format=RGB ! \
                        appsink name=appsink sync=false max-buffers=2";

/// Decoded file playback; pacing is left to the capture loop
pub struct GstFileCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: gst::ClockTime,
    pending: Option<gst::Sample>,
    native_fps: Option<f64>,
}

impl GstFileCapture {
    pub fn open(path: &Path, read_timeout: Duration) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| gst_error("initialize GStreamer", e))?;

        let location = path
            .to_str()
            .ok_or_else(|| CaptureError::SourceUnavailable(format!("{}: non UTF-8 path", path.display())))?;
        info!("Opening {} through GStreamer", location);

        let pipeline = gst::parse::launch(PIPELINE)
            .map_err(|e| gst_error("build pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::SourceUnavailable("Failed to create pipeline".into()))?;

        let src = pipeline
            .by_name("src")
            .ok_or_else(|| CaptureError::SourceUnavailable("Failed to find filesrc".into()))?;
        src.set_property("location", location);

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CaptureError::SourceUnavailable("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::SourceUnavailable("Failed to cast to AppSink".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| gst_error("start pipeline", e))?;

        let mut capture = Self {
            pipeline,
            appsink,
            read_timeout: gst::ClockTime::from_mseconds(read_timeout.as_millis() as u64),
            pending: None,
            native_fps: None,
        };

        // First sample carries the negotiated caps and the stream's frame rate
        let first = capture
            .appsink
            .try_pull_sample(gst::ClockTime::from_seconds(5))
            .ok_or_else(|| {
                CaptureError::SourceUnavailable(format!("{location}: no decodable video stream"))
            })?;
        capture.native_fps = first
            .caps()
            .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
            .map(|info| info.fps())
            .filter(|fps| fps.denom() > 0 && fps.numer() > 0)
            .map(|fps| fps.numer() as f64 / fps.denom() as f64);
        debug!("Native frame rate: {:?}", capture.native_fps);
        capture.pending = Some(first);

        Ok(capture)
    }

    fn sample_to_image(sample: &gst::Sample) -> Result<(RgbImage, Option<Duration>), CaptureError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Read("Sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Read("Sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| CaptureError::Read("Failed to parse video info from caps".into()))?;

        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Read("Failed to map buffer".into()))?;

        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0].max(0) as usize;
        let row = width as usize * 3;
        let data = map.as_slice();

        let mut rgb = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let line = data
                .get(y * stride..y * stride + row)
                .ok_or_else(|| CaptureError::Decode("buffer shorter than caps".into()))?;
            rgb.extend_from_slice(line);
        }

        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| CaptureError::Decode("RGB size mismatch".into()))?;
        let timestamp = buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds()));
        Ok((image, timestamp))
    }
}

impl CaptureBackend for GstFileCapture {
    fn read(&mut self) -> Result<ReadOutcome, CaptureError> {
        let sample = match self.pending.take() {
            Some(sample) => sample,
            None => match self.appsink.try_pull_sample(self.read_timeout) {
                Some(sample) => sample,
                None if self.appsink.is_eos() => return Ok(ReadOutcome::EndOfStream),
                None => return Err(CaptureError::Read("no sample within read timeout".into())),
            },
        };
        let (image, timestamp) = Self::sample_to_image(&sample)?;
        Ok(ReadOutcome::Frame { image, timestamp })
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.pending = None;
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::ZERO,
            )
            .map_err(|e| gst_error("seek to start", e))
    }

    fn native_fps(&self) -> Option<f64> {
        self.native_fps
    }
}

impl Drop for GstFileCapture {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn gst_error(what: &str, e: impl std::fmt::Debug) -> CaptureError {
    CaptureError::SourceUnavailable(format!("Failed to {what}: {e:?}"))
}
