//! Inference thread: one request at a time, one result per accepted request

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::RgbImage;
use tracing::{debug, error, info, instrument, warn};

use super::output::to_probability;
use super::overlay::{build_overlay, Overlay, OverlayStyle};
use super::segmenter::{EdgeFallback, InputTensor, Segmenter};
use crate::capture::Frame;
use crate::error::InferenceError;
use crate::pipeline::{EventSender, PipelineEvent};
use crate::{Config, ModelConfig, OverlayConfig};

/// Builds the model on the inference thread
pub type ModelLoader = Box<dyn FnOnce() -> Result<Box<dyn Segmenter>, InferenceError> + Send>;

/// Which segmenter produces overlays for this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Model,
    /// Edge-magnitude heuristic; no model configured or it failed to load
    Fallback,
}

/// The single request handed to the worker
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub frame_id: u64,
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Counters since the engine started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Shared {
    busy: AtomicBool,
    enabled: AtomicBool,
    stop: AtomicBool,
    style: ArcSwap<OverlayStyle>,
    stats: CachePadded<Stats>,
}

/// Handle to the inference thread
pub struct InferenceEngine {
    shared: Arc<Shared>,
    requests: Sender<PendingRequest>,
    worker: Option<JoinHandle<()>>,
}

impl InferenceEngine {
    /// Engine for the configured checkpoint, or the edge fallback when none is set
    pub fn from_config(config: &Config, events: EventSender) -> Result<Self, InferenceError> {
        Self::spawn(&config.model, &config.overlay, model_loader(&config.model), events)
    }

    pub fn spawn(
        model: &ModelConfig,
        overlay: &OverlayConfig,
        loader: Option<ModelLoader>,
        events: EventSender,
    ) -> Result<Self, InferenceError> {
        let shared = Arc::new(Shared {
            busy: AtomicBool::new(false),
            enabled: AtomicBool::new(overlay.enabled),
            stop: AtomicBool::new(false),
            style: ArcSwap::from_pointee(OverlayStyle::from(overlay)),
            stats: CachePadded::new(Stats::default()),
        });
        let (tx, rx) = flume::bounded(1);

        let worker = InferenceWorker {
            shared: Arc::clone(&shared),
            requests: rx,
            events,
            loader,
            fallback: EdgeFallback::new(model.input_size()),
            min_interval: model.min_interval(),
            dequeue_timeout: model.dequeue_timeout(),
            slow_warn: Duration::from_millis(model.slow_inference_warn_ms),
        };

        let handle = std::thread::Builder::new()
            .name("inference".into())
            .spawn(move || worker.run())
            .map_err(|e| InferenceError::ModelLoad(format!("cannot start inference thread: {e}")))?;

        Ok(Self {
            shared,
            requests: tx,
            worker: Some(handle),
        })
    }

    /// Hand one frame to the worker. Rejected while a request is in flight.
    pub fn submit(&self, frame: &Frame) -> Result<(), InferenceError> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(InferenceError::EngineStopped);
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(InferenceError::EngineBusy);
        }

        let request = PendingRequest {
            frame_id: frame.id(),
            pixels: frame.pixels.clone(),
            width: frame.width(),
            height: frame.height(),
        };
        if self.requests.try_send(request).is_err() {
            self.shared.busy.store(false, Ordering::SeqCst);
            return Err(InferenceError::EngineStopped);
        }
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        !self.shared.busy.load(Ordering::SeqCst)
    }

    /// Takes effect on the next processed request; the model stays loaded
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn set_style(&self, style: OverlayStyle) {
        self.shared.style.store(Arc::new(style));
    }

    pub fn style(&self) -> Arc<OverlayStyle> {
        self.shared.style.load_full()
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.shared.stats;
        EngineStats {
            submitted: s.submitted.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker; it exits within one dequeue timeout of its current step
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Inference thread panicked");
            }
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Loader for the configured checkpoint, if any
pub fn model_loader(config: &ModelConfig) -> Option<ModelLoader> {
    let path = config.path.clone()?;

    #[cfg(feature = "onnx")]
    {
        let config = config.clone();
        Some(Box::new(move || {
            let model = super::onnx::OnnxSegmenter::load(&path, &config)?;
            Ok(Box::new(model) as Box<dyn Segmenter>)
        }))
    }

    #[cfg(not(feature = "onnx"))]
    {
        Some(Box::new(move || {
            Err(InferenceError::ModelLoad(format!(
                "{}: built without the onnx feature",
                path.display()
            )))
        }))
    }
}

struct InferenceWorker {
    shared: Arc<Shared>,
    requests: Receiver<PendingRequest>,
    events: EventSender,
    loader: Option<ModelLoader>,
    fallback: EdgeFallback,
    min_interval: Duration,
    dequeue_timeout: Duration,
    slow_warn: Duration,
}

impl InferenceWorker {
    fn run(mut self) {
        let mut model = self.load_model();
        let mut last_start: Option<Instant> = None;

        while !self.stopped() {
            let request = match self.requests.recv_timeout(self.dequeue_timeout) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if let Some(last) = last_start {
                self.wait_until(last.checked_add(self.min_interval));
            }
            if self.stopped() {
                break;
            }
            last_start = Some(Instant::now());

            let frame_id = request.frame_id;
            let outcome = self.process(&request, &mut model);
            drop(request);

            // Idle before the result is visible so the coordinator can resubmit at once
            self.shared.busy.store(false, Ordering::SeqCst);

            match outcome {
                Ok(overlay) => {
                    self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                    self.emit(PipelineEvent::OverlayReady(overlay));
                }
                Err(e) => {
                    self.shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("inference_errors_total").increment(1);
                    warn!("Inference on frame {} failed: {}", frame_id, e);
                    self.emit(PipelineEvent::InferenceFailed {
                        frame_id,
                        message: format!("Inference error: {e}"),
                    });
                }
            }
        }

        while self.requests.try_recv().is_ok() {}
        self.shared.busy.store(false, Ordering::SeqCst);
        debug!("Inference loop exited");
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Load once; any failure switches to the fallback for the rest of the session
    fn load_model(&mut self) -> Option<Box<dyn Segmenter>> {
        let Some(loader) = self.loader.take() else {
            info!("No segmentation model configured, using edge fallback");
            self.emit(PipelineEvent::EngineReady(EngineMode::Fallback));
            return None;
        };

        let loaded = panic::catch_unwind(AssertUnwindSafe(loader))
            .unwrap_or_else(|payload| Err(InferenceError::ModelLoad(panic_message(&payload))));

        match loaded {
            Ok(model) => {
                info!("Segmentation model ready ({})", model.name());
                self.emit(PipelineEvent::EngineReady(EngineMode::Model));
                Some(model)
            }
            Err(e) => {
                error!("{}; using edge fallback", e);
                self.emit(PipelineEvent::ModelLoadFailed(e.to_string()));
                None
            }
        }
    }

    #[instrument(skip_all, fields(frame_id = request.frame_id))]
    fn process(
        &mut self,
        request: &PendingRequest,
        model: &mut Option<Box<dyn Segmenter>>,
    ) -> Result<Overlay, InferenceError> {
        let (width, height) = (request.width, request.height);

        if !self.shared.enabled.load(Ordering::SeqCst) {
            return Ok(Overlay::transparent(request.frame_id, width, height));
        }

        let image = RgbImage::from_raw(width, height, request.pixels.to_vec()).ok_or_else(|| {
            InferenceError::Shape(format!(
                "{} bytes do not form a {}x{} RGB frame",
                request.pixels.len(),
                width,
                height
            ))
        })?;

        let segmenter: &mut (dyn Segmenter + 'static) = match model {
            Some(model) => &mut **model,
            None => &mut self.fallback,
        };

        let started = Instant::now();
        let input = InputTensor::from_rgb(&image, segmenter.input_size());
        let output = panic::catch_unwind(AssertUnwindSafe(|| segmenter.forward(&input)))
            .unwrap_or_else(|payload| Err(InferenceError::Forward(panic_message(&payload))))?;

        let prob = to_probability(&output.select()?)?;
        let style = self.shared.style.load();
        let overlay = build_overlay(request.frame_id, &prob, &style, (width, height));

        let elapsed = started.elapsed();
        metrics::counter!("inference_runs_total").increment(1);
        metrics::histogram!("inference_time_ms").record(elapsed.as_secs_f64() * 1000.0);
        if elapsed > self.slow_warn {
            warn!(
                "Slow inference on frame {}: {:?} ({})",
                request.frame_id,
                elapsed,
                segmenter.name()
            );
        }

        Ok(overlay)
    }

    /// Rate limit: an accepted request is delayed, never dropped.
    /// `None` is a deadline past the end of time; only `stop` ends the wait.
    fn wait_until(&self, deadline: Option<Instant>) {
        while !self.stopped() {
            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => (deadline - now).min(self.dequeue_timeout),
                None => self.dequeue_timeout,
            };
            std::thread::sleep(pause);
        }
    }

    /// Results must reach the coordinator, so keep retrying until stopped
    fn emit(&self, event: PipelineEvent) {
        let mut event = event;
        loop {
            match self.events.send_timeout(event, self.dequeue_timeout) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) if !self.stopped() => event = back,
                Err(_) => {
                    debug!("Dropped inference notification");
                    return;
                }
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("model panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("model panicked: {s}")
    } else {
        "model panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::output::{ModelOutput, OutputTensor};
    use image::Rgb;

    struct Constant(f32);

    impl Segmenter for Constant {
        fn input_size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn forward(&mut self, _input: &InputTensor) -> Result<ModelOutput, InferenceError> {
            Ok(ModelOutput::Tensor(OutputTensor::new(vec![1, 1, 4, 4], vec![self.0; 16])?))
        }
    }

    struct Failing;

    impl Segmenter for Failing {
        fn input_size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn forward(&mut self, _input: &InputTensor) -> Result<ModelOutput, InferenceError> {
            panic!("bad kernel")
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.model.target_rate = 0.0;
        config.model.dequeue_timeout_ms = 20;
        config.overlay.threshold = 0.0;
        config.overlay.gamma = 1.0;
        config
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, RgbImage::from_pixel(8, 6, Rgb([120, 60, 60])))
    }

    fn engine_with(loader: Option<ModelLoader>) -> (InferenceEngine, flume::Receiver<PipelineEvent>) {
        let config = config();
        let (tx, rx) = flume::unbounded();
        let engine = InferenceEngine::spawn(&config.model, &config.overlay, loader, tx).unwrap();
        (engine, rx)
    }

    fn next_result(rx: &flume::Receiver<PipelineEvent>) -> PipelineEvent {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipelineEvent::EngineReady(_) | PipelineEvent::ModelLoadFailed(_) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn overlay_carries_frame_id_and_size() {
        let (engine, rx) = engine_with(Some(Box::new(|| Ok(Box::new(Constant(1.0)) as Box<dyn Segmenter>))));
        engine.submit(&frame(42)).unwrap();

        match next_result(&rx) {
            PipelineEvent::OverlayReady(overlay) => {
                assert_eq!(overlay.frame_id, 42);
                assert_eq!((overlay.width, overlay.height), (8, 6));
                assert!(overlay.pixels.chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(engine.is_idle());
        assert_eq!(engine.stats().completed, 1);
    }

    #[test]
    fn second_submit_is_rejected_while_busy() {
        let (engine, rx) = engine_with(Some(Box::new(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Box::new(Constant(0.5)) as Box<dyn Segmenter>)
        })));
        engine.submit(&frame(1)).unwrap();
        assert_eq!(engine.submit(&frame(2)), Err(InferenceError::EngineBusy));
        assert!(!engine.is_idle());

        assert!(matches!(next_result(&rx), PipelineEvent::OverlayReady(o) if o.frame_id == 1));
        engine.submit(&frame(3)).unwrap();
        assert!(matches!(next_result(&rx), PipelineEvent::OverlayReady(o) if o.frame_id == 3));
        assert_eq!(engine.stats().rejected, 1);
    }

    #[test]
    fn disabled_engine_emits_transparent_overlay() {
        let (engine, rx) = engine_with(Some(Box::new(|| Ok(Box::new(Constant(1.0)) as Box<dyn Segmenter>))));
        engine.set_enabled(false);
        engine.submit(&frame(5)).unwrap();
        match next_result(&rx) {
            PipelineEvent::OverlayReady(overlay) => {
                assert_eq!(overlay.frame_id, 5);
                assert!(overlay.is_transparent());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panicking_forward_reports_error_and_recovers() {
        let (engine, rx) = engine_with(Some(Box::new(|| Ok(Box::new(Failing) as Box<dyn Segmenter>))));
        engine.submit(&frame(7)).unwrap();
        match next_result(&rx) {
            PipelineEvent::InferenceFailed { frame_id, message } => {
                assert_eq!(frame_id, 7);
                assert!(message.contains("bad kernel"));
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.submit(&frame(8)).unwrap();
        assert!(matches!(next_result(&rx), PipelineEvent::InferenceFailed { frame_id: 8, .. }));
    }

    #[test]
    fn load_failure_is_reported_once_and_falls_back() {
        let (engine, rx) = engine_with(Some(Box::new(|| {
            Err(InferenceError::ModelLoad("checkpoint missing".into()))
        })));

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::ModelLoadFailed(msg) => assert!(msg.contains("checkpoint missing")),
            other => panic!("unexpected {other:?}"),
        }
        for id in [1, 2] {
            engine.submit(&frame(id)).unwrap();
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipelineEvent::OverlayReady(overlay) => assert_eq!(overlay.frame_id, id),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn stop_is_prompt_and_rejects_later_submits() {
        let (mut engine, _rx) = engine_with(None);
        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.submit(&frame(1)), Err(InferenceError::EngineStopped));
        engine.stop();
    }

    #[test]
    fn vanishing_rate_holds_requests_until_stop() {
        let mut config = config();
        config.model.target_rate = 1e-30;
        let (tx, rx) = flume::unbounded();
        let mut engine = InferenceEngine::spawn(&config.model, &config.overlay, None, tx).unwrap();

        engine.submit(&frame(1)).unwrap();
        assert!(matches!(next_result(&rx), PipelineEvent::OverlayReady(_)));
        engine.submit(&frame(2)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn style_swaps_live() {
        let (engine, _rx) = engine_with(None);
        let mut style = (*engine.style()).clone();
        style.threshold = 0.9;
        engine.set_style(style.clone());
        assert_eq!(*engine.style(), style);
    }
}
