//! Capture thread: reads, paces and publishes frames with strictly increasing ids

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::SendTimeoutError;
use image::RgbImage;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{BackendFactory, CaptureBackend, ReadOutcome, ResolvedSource, SourceSpec};
use super::frame::Frame;
use crate::error::CaptureError;
use crate::pipeline::{EventSender, PipelineEvent};
use crate::{utils, CaptureConfig};

const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Owns the capture device through a dedicated thread
pub struct FrameSource {
    config: CaptureConfig,
    factory: Arc<dyn BackendFactory>,
    events: EventSender,
    /// Shared across reopens so ids keep increasing when the source changes
    last_id: Arc<AtomicU64>,
    worker: Option<CaptureWorker>,
    active: Option<ResolvedSource>,
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FrameSource {
    pub fn new(config: CaptureConfig, factory: Arc<dyn BackendFactory>, events: EventSender) -> Self {
        Self {
            config,
            factory,
            events,
            last_id: Arc::new(AtomicU64::new(0)),
            worker: None,
            active: None,
        }
    }

    /// Turn a spec into a concrete device or file, probing cameras for `Auto`
    pub fn resolve(&self, spec: &SourceSpec) -> Result<ResolvedSource, CaptureError> {
        match spec {
            SourceSpec::Auto => utils::auto_detect_source(self.factory.as_ref(), &self.config),
            SourceSpec::Camera(index) => Ok(ResolvedSource::Camera(*index)),
            SourceSpec::File(path) if path.is_file() => Ok(ResolvedSource::File(path.clone())),
            SourceSpec::File(path) => Err(CaptureError::SourceUnavailable(format!(
                "{} does not exist or is not a file",
                path.display()
            ))),
        }
    }

    /// Open a source and start capturing. Any previous source is closed first.
    #[instrument(skip(self))]
    pub fn open(&mut self, spec: &SourceSpec) -> Result<ResolvedSource, CaptureError> {
        self.close();

        let source = self.resolve(spec)?;
        let backend = self.factory.open(&source, &self.config).map_err(|e| match e {
            CaptureError::SourceUnavailable(_) | CaptureError::UnsupportedSource(_) => e,
            other => CaptureError::SourceUnavailable(format!("{source}: {other}")),
        })?;
        info!("Opened {}", source);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = CaptureLoop {
            source: source.clone(),
            backend: Some(backend),
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
            events: self.events.clone(),
            stop: Arc::clone(&stop),
            last_id: Arc::clone(&self.last_id),
            link: LinkState::default(),
        };

        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || worker.run())?;

        self.worker = Some(CaptureWorker { stop, handle });
        self.active = Some(source.clone());
        Ok(source)
    }

    /// Stop the capture thread and release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        if worker.handle.join().is_err() {
            error!("Capture thread panicked");
        }
        if let Some(source) = self.active.take() {
            info!("Closed {}", source);
        }
    }

    /// True while the capture thread is alive
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_source(&self) -> Option<&ResolvedSource> {
        self.active.as_ref()
    }

    /// Id of the most recently captured frame (0 before the first)
    pub fn last_frame_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

enum Flow {
    Continue,
    Stop,
}

struct CaptureLoop {
    source: ResolvedSource,
    backend: Option<Box<dyn CaptureBackend>>,
    factory: Arc<dyn BackendFactory>,
    config: CaptureConfig,
    events: EventSender,
    stop: Arc<AtomicBool>,
    last_id: Arc<AtomicU64>,
    link: LinkState,
}

impl CaptureLoop {
    fn run(mut self) {
        if let Some(core) = self.config.pin_core {
            pin_to_core(core);
        }

        self.set_connected(true);
        self.sleep(self.config.warmup());
        let mut pacer = self.pacer();
        let mut failures = 0u32;

        while !self.stopped() {
            let Some(backend) = self.backend.as_mut() else {
                if self.reconnect() {
                    pacer = self.pacer();
                    failures = 0;
                }
                continue;
            };

            let flow = match backend.read() {
                Ok(ReadOutcome::Frame { image, timestamp }) => {
                    failures = 0;
                    if let Some(pacer) = pacer.as_mut() {
                        self.sleep(pacer.delay(Instant::now()));
                        pacer.mark_emitted(Instant::now());
                    }
                    if self.stopped() {
                        Flow::Stop
                    } else {
                        self.publish(image, timestamp)
                    }
                }
                Ok(ReadOutcome::EndOfStream) if self.source.is_file() => {
                    let flow = self.end_of_file();
                    if let Some(pacer) = pacer.as_mut() {
                        pacer.reset();
                    }
                    flow
                }
                Ok(ReadOutcome::EndOfStream) => {
                    self.read_failed(&mut failures, CaptureError::Read("camera stream ended".into()))
                }
                Err(e) => self.read_failed(&mut failures, e),
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        // Release before reporting the link as down
        self.backend = None;
        self.set_connected(false);
        debug!("Capture loop for {} exited", self.source);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Files are paced to an explicit override, else their native rate, else the
    /// configured rate. Cameras run at their own rate.
    fn pacer(&self) -> Option<Pacer> {
        if !self.source.is_file() {
            return None;
        }
        let native = self.backend.as_ref().and_then(|b| b.native_fps());
        let fps = self
            .config
            .playback_fps
            .filter(|fps| *fps > 0.0)
            .or(native.filter(|fps| *fps > 1.0))
            .unwrap_or(self.config.fps);
        debug!("Pacing {} at {:.2} fps", self.source, fps);
        Some(Pacer::new(fps))
    }

    fn publish(&mut self, image: RgbImage, timestamp: Option<Duration>) -> Flow {
        let frame_id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Frame::new(frame_id, image).with_source_timestamp(timestamp);
        metrics::counter!("frames_captured_total").increment(1);

        match self
            .events
            .send_timeout(PipelineEvent::Frame(frame), self.config.read_timeout())
        {
            Ok(()) => Flow::Continue,
            Err(SendTimeoutError::Timeout(_)) => {
                metrics::counter!("frames_dropped_total").increment(1);
                debug!("Event queue full, dropped frame {}", frame_id);
                Flow::Continue
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                debug!("Event receiver dropped, stopping capture");
                Flow::Stop
            }
        }
    }

    fn end_of_file(&mut self) -> Flow {
        if !self.config.loop_video {
            info!("End of {}", self.source);
            self.notify(PipelineEvent::StreamFinished);
            return Flow::Stop;
        }

        let Some(backend) = self.backend.as_mut() else {
            return Flow::Continue;
        };
        match backend.rewind() {
            Ok(()) => {
                debug!("Looping {}", self.source);
                Flow::Continue
            }
            Err(e) => {
                warn!("Cannot loop {}: {}", self.source, e);
                self.notify(PipelineEvent::SourceError(format!("Cannot loop video: {e}")));
                self.notify(PipelineEvent::StreamFinished);
                Flow::Stop
            }
        }
    }

    /// Single failures are retried with backoff; a run of them drops the link
    fn read_failed(&mut self, failures: &mut u32, err: CaptureError) -> Flow {
        *failures += 1;
        metrics::counter!("capture_read_failures_total").increment(1);
        debug!("Read failure {} on {}: {}", failures, self.source, err);

        if *failures < self.config.max_read_failures.max(1) {
            self.sleep(backoff(*failures));
            return Flow::Continue;
        }

        if self.source.is_file() {
            error!("Giving up on {}: {}", self.source, err);
            self.notify(PipelineEvent::SourceError(format!(
                "Failed to read video file: {err}"
            )));
            return Flow::Stop;
        }

        warn!("{} stopped delivering frames: {}", self.source, err);
        *failures = 0;
        self.backend = None;
        self.set_connected(false);
        Flow::Continue
    }

    /// One reopen attempt; waits out the retry interval on failure
    fn reconnect(&mut self) -> bool {
        match self.factory.open(&self.source, &self.config) {
            Ok(backend) => {
                info!("Reconnected {}", self.source);
                self.backend = Some(backend);
                self.set_connected(true);
                self.sleep(self.config.warmup());
                true
            }
            Err(e) => {
                debug!("Reopen of {} failed: {}", self.source, e);
                self.sleep(RECONNECT_INTERVAL);
                false
            }
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if self.link.set(connected) {
            self.notify(PipelineEvent::Connectivity(connected));
        }
    }

    fn notify(&self, event: PipelineEvent) {
        let sent = if self.stopped() {
            self.events.try_send(event).is_ok()
        } else {
            self.events
                .send_timeout(event, self.config.read_timeout())
                .is_ok()
        };
        if !sent {
            debug!("Dropped capture notification");
        }
    }

    /// Sleep in read-timeout slices so a stop request is seen promptly
    fn sleep(&self, total: Duration) {
        let slice = self.config.read_timeout();
        let deadline = Instant::now() + total;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(slice));
        }
    }
}

fn backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(6);
    (BACKOFF_BASE * factor).min(BACKOFF_MAX)
}

fn pin_to_core(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("Cannot enumerate CPU cores; capture thread not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => info!("Capture thread pinned to core {}", core),
        _ => warn!("Failed to pin capture thread to core {}", core),
    }
}

/// Connected/disconnected state that reports only actual transitions
#[derive(Debug, Default)]
pub(crate) struct LinkState {
    connected: bool,
}

impl LinkState {
    /// Returns true when the state changed
    pub(crate) fn set(&mut self, connected: bool) -> bool {
        let changed = self.connected != connected;
        self.connected = connected;
        changed
    }
}

/// Emission schedule for file playback: frame `n` is due at `start + n * period`
#[derive(Debug)]
pub(crate) struct Pacer {
    period_ns: u64,
    start: Instant,
    index: u64,
}

impl Pacer {
    pub(crate) fn new(fps: f64) -> Self {
        Self::starting_at(fps, Instant::now())
    }

    pub(crate) fn starting_at(fps: f64, start: Instant) -> Self {
        Self {
            period_ns: (1e9 / fps.max(1.0)).round() as u64,
            start,
            index: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.start = Instant::now();
        self.index = 0;
    }

    fn due(&self) -> Instant {
        self.start + Duration::from_nanos(self.period_ns.saturating_mul(self.index))
    }

    /// How long to wait before emitting the next frame
    pub(crate) fn delay(&self, now: Instant) -> Duration {
        self.due().saturating_duration_since(now)
    }

    /// Advance the schedule; more than 1.5 periods late skips whole slots
    pub(crate) fn mark_emitted(&mut self, now: Instant) {
        let behind = now.saturating_duration_since(self.due()).as_nanos() as u64;
        if behind > self.period_ns + self.period_ns / 2 {
            self.index += behind / self.period_ns.max(1);
        }
        self.index += 1;
    }
}
