//! Owns the capture thread, the inference engine and the coordinator, and feeds
//! delivered events to a display on the calling thread.

use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, info, instrument, warn};

use super::annotations::{Annotation, AnnotationLog};
use super::coordinator::{CoordinatorOptions, SyncCoordinator};
use super::{EventReceiver, PipelineEvent};
use crate::capture::{BackendFactory, DeviceFactory, FrameSource, ResolvedSource, SourceSpec};
use crate::display::DisplaySurface;
use crate::error::CaptureError;
use crate::inference::{model_loader, EngineMode, InferenceEngine, ModelLoader, OverlayStyle};
use crate::Config;

pub struct Pipeline {
    config: Config,
    source: FrameSource,
    coordinator: SyncCoordinator<InferenceEngine>,
    annotations: AnnotationLog,
    events: EventReceiver,
    engine_mode: Option<EngineMode>,
    finished: bool,
    stopped: bool,
}

impl Pipeline {
    /// Real devices and the configured model
    pub fn new(config: Config) -> Result<Self> {
        let loader = model_loader(&config.model);
        Self::with_parts(config, Arc::new(DeviceFactory), loader)
    }

    pub fn with_parts(
        config: Config,
        factory: Arc<dyn BackendFactory>,
        loader: Option<ModelLoader>,
    ) -> Result<Self> {
        let (tx, rx) = flume::bounded(config.pipeline.event_queue.max(1));

        let engine = InferenceEngine::spawn(&config.model, &config.overlay, loader, tx.clone())?;
        let coordinator = SyncCoordinator::new(
            engine,
            CoordinatorOptions {
                cache_capacity: config.pipeline.cache_capacity,
                overlay_enabled: config.overlay.enabled,
                opacity: config.overlay.opacity,
                passthrough_while_pending: config.display.passthrough_while_pending,
            },
        );
        let source = FrameSource::new(config.capture.clone(), factory, tx);

        Ok(Self {
            config,
            source,
            coordinator,
            annotations: AnnotationLog::new(),
            events: rx,
            engine_mode: None,
            finished: false,
            stopped: false,
        })
    }

    /// Switch to another source. Failures go to the display and leave the pipeline usable.
    #[instrument(skip(self, display))]
    pub fn open_source<D: DisplaySurface + ?Sized>(
        &mut self,
        spec: &SourceSpec,
        display: &mut D,
    ) -> Result<ResolvedSource, CaptureError> {
        match self.source.open(spec) {
            Ok(source) => {
                self.finished = false;
                display.on_debug(&format!("Opened {source}"));
                Ok(source)
            }
            Err(e) => {
                let message = match &e {
                    CaptureError::NoCameraAvailable => {
                        "No camera found. Please choose a video file.".to_string()
                    }
                    other => format!("Cannot open source: {other}"),
                };
                warn!("{}", message);
                display.on_error(&message);
                Err(e)
            }
        }
    }

    pub fn close_source(&mut self) {
        self.source.close();
    }

    pub fn set_overlay_enabled<D: DisplaySurface + ?Sized>(&mut self, enabled: bool, display: &mut D) {
        self.coordinator.set_overlay_enabled(enabled, display);
    }

    pub fn set_overlay_opacity(&mut self, opacity: f32) {
        self.coordinator.set_overlay_opacity(opacity);
    }

    /// Threshold, gamma and color changes apply from the next inference on
    pub fn set_overlay_style(&self, style: OverlayStyle) {
        self.coordinator.engine().set_style(style);
    }

    /// Record a finding at image coordinates; returns its 1-based index
    pub fn mark_region_of_interest(&mut self, image_x: u32, image_y: u32, comment: &str) -> u32 {
        let annotation = self.annotations.mark(image_x, image_y, comment);
        info!("Annotation {}", annotation);
        annotation.index
    }

    pub fn annotations(&self) -> &[Annotation] {
        self.annotations.entries()
    }

    pub fn annotation_log(&self) -> &AnnotationLog {
        &self.annotations
    }

    /// Handle every event delivered so far; never waits
    pub fn pump<D: DisplaySurface + ?Sized>(&mut self, display: &mut D) -> usize {
        let pending: Vec<PipelineEvent> = self.events.drain().collect();
        let count = pending.len();
        for event in pending {
            self.handle(event, display);
        }
        count
    }

    /// Handle events as they arrive until `shutdown` resolves, or until a
    /// non-looping file has finished and its last inference came back
    pub async fn run<D, S>(&mut self, display: &mut D, shutdown: S)
    where
        D: DisplaySurface + ?Sized,
        S: Future<Output = ()>,
    {
        let events = self.events.clone();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv_async() => match event {
                    Ok(event) => self.handle(event, display),
                    Err(_) => break,
                }
            }
            if self.finished && self.coordinator.inflight().is_none() {
                debug!("Stream finished and no inference pending");
                break;
            }
        }
    }

    pub fn handle<D: DisplaySurface + ?Sized>(&mut self, event: PipelineEvent, display: &mut D) {
        match event {
            PipelineEvent::Frame(frame) => self.coordinator.on_frame(frame, display),
            PipelineEvent::OverlayReady(overlay) => self.coordinator.on_overlay(overlay, display),
            PipelineEvent::InferenceFailed { frame_id, message } => {
                self.coordinator.on_inference_failed(frame_id, &message, display)
            }
            PipelineEvent::Connectivity(connected) => display.on_connectivity_changed(connected),
            PipelineEvent::StreamFinished => {
                self.finished = true;
                display.on_stream_finished();
            }
            PipelineEvent::SourceError(message) => display.on_error(&message),
            PipelineEvent::ModelLoadFailed(message) => {
                self.engine_mode = Some(EngineMode::Fallback);
                display.on_error(&format!(
                    "Segmentation model unavailable ({message}); showing edge fallback overlay"
                ));
            }
            PipelineEvent::EngineReady(mode) => {
                self.engine_mode = Some(mode);
                display.on_debug(&format!("Inference engine ready ({mode:?})"));
            }
        }
    }

    /// Stop capture and inference; both threads are joined
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.source.close();
        self.coordinator.engine_mut().stop();
        info!("Pipeline stopped");
    }

    pub fn coordinator(&self) -> &SyncCoordinator<InferenceEngine> {
        &self.coordinator
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    /// Known once the engine has tried to load its model
    pub fn engine_mode(&self) -> Option<EngineMode> {
        self.engine_mode
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
