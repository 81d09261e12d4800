//! Pairs frames with the overlay computed from exactly that frame.
//!
//! Runs on the UI thread and never blocks. At most one frame is with the engine at
//! a time; while it is busy only the newest frame is remembered, so the pair on
//! screen lags the camera by at most one inference cycle.

use tracing::{debug, trace, warn};

use super::cache::IdCache;
use crate::capture::frame::BLANK_THRESHOLD;
use crate::capture::Frame;
use crate::display::DisplaySurface;
use crate::error::InferenceError;
use crate::inference::{InferenceEngine, Overlay};

/// The coordinator's view of the inference engine
pub trait InferenceDispatch {
    /// Hand a frame over; must not block
    fn submit(&self, frame: &Frame) -> Result<(), InferenceError>;

    fn is_idle(&self) -> bool;

    fn set_enabled(&self, enabled: bool);
}

impl InferenceDispatch for InferenceEngine {
    fn submit(&self, frame: &Frame) -> Result<(), InferenceError> {
        InferenceEngine::submit(self, frame)
    }

    fn is_idle(&self) -> bool {
        InferenceEngine::is_idle(self)
    }

    fn set_enabled(&self, enabled: bool) {
        InferenceEngine::set_enabled(self, enabled)
    }
}

/// A frame ready to show, with its overlay unless overlays are off
#[derive(Debug, Clone)]
pub struct DisplayPair {
    pub frame: Frame,
    pub overlay: Option<Overlay>,
}

impl DisplayPair {
    /// `None` when the ids disagree
    pub fn matched(frame: Frame, overlay: Overlay) -> Option<Self> {
        (frame.id() == overlay.frame_id).then_some(Self {
            frame,
            overlay: Some(overlay),
        })
    }

    pub fn raw(frame: Frame) -> Self {
        Self {
            frame,
            overlay: None,
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame.id()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub cache_capacity: usize,
    pub overlay_enabled: bool,
    pub opacity: f32,
    pub passthrough_while_pending: bool,
}

pub struct SyncCoordinator<E> {
    engine: E,
    frames: IdCache<Frame>,
    overlays: IdCache<Overlay>,
    latest: Option<Frame>,
    inflight: Option<u64>,
    /// Newest id handed to the engine; frames at or below it are not dispatched again
    last_dispatched: Option<u64>,
    last_shown: Option<u64>,
    overlay_enabled: bool,
    opacity: f32,
    passthrough: bool,
    signal_blank: Option<bool>,
    evictions: u64,
}

impl<E: InferenceDispatch> SyncCoordinator<E> {
    pub fn new(engine: E, options: CoordinatorOptions) -> Self {
        engine.set_enabled(options.overlay_enabled);
        Self {
            engine,
            frames: IdCache::new(options.cache_capacity),
            overlays: IdCache::new(options.cache_capacity),
            latest: None,
            inflight: None,
            last_dispatched: None,
            last_shown: None,
            overlay_enabled: options.overlay_enabled,
            opacity: clamp_opacity(options.opacity, 1.0),
            passthrough: options.passthrough_while_pending,
            signal_blank: None,
            evictions: 0,
        }
    }

    pub fn on_frame<D: DisplaySurface + ?Sized>(&mut self, frame: Frame, display: &mut D) {
        let id = frame.id();
        if self.latest_frame_id().is_some_and(|latest| id <= latest) {
            warn!("Frame {} arrived after {:?}, ignored", id, self.latest_frame_id());
            return;
        }

        let blank = frame.is_blank(BLANK_THRESHOLD);
        if self.signal_blank != Some(blank) {
            self.signal_blank = Some(blank);
            display.on_signal_blank(blank);
        }

        if let Some(previous) = self.latest.as_ref().map(Frame::id) {
            if self.overlay_enabled && self.last_dispatched.map_or(true, |d| previous > d) {
                metrics::counter!("frames_skipped_total").increment(1);
                trace!("Frame {} skipped", previous);
            }
        }

        let evicted = self.frames.insert(id, frame.clone(), self.inflight);
        self.count_evictions(evicted);
        self.latest = Some(frame);

        if !self.overlay_enabled || self.passthrough {
            if let Some(frame) = self.latest.as_ref() {
                display.on_frame_ready(frame);
            }
        }
        if self.overlay_enabled {
            self.dispatch_latest(false);
        }
    }

    pub fn on_overlay<D: DisplaySurface + ?Sized>(&mut self, overlay: Overlay, display: &mut D) {
        let id = overlay.frame_id;
        self.resolve_inflight(id);

        if self.overlay_enabled || !overlay.is_transparent() {
            let evicted = self.overlays.insert(id, overlay, None);
            self.count_evictions(evicted);
        }

        if self.overlay_enabled {
            if self.last_shown.is_some_and(|shown| id <= shown) {
                debug!("Overlay {} is older than the pair on screen, dropped", id);
            } else if self.show_pair(id, display) {
                self.frames.remove_below(id);
                self.overlays.remove_below(id);
            } else {
                debug!("Frame {} no longer cached, overlay kept for later", id);
            }
            self.dispatch_latest(false);
        }
    }

    pub fn on_inference_failed<D: DisplaySurface + ?Sized>(
        &mut self,
        frame_id: u64,
        message: &str,
        display: &mut D,
    ) {
        self.resolve_inflight(frame_id);
        display.on_error(message);
        if self.overlay_enabled {
            self.dispatch_latest(false);
        }
    }

    pub fn set_overlay_enabled<D: DisplaySurface + ?Sized>(&mut self, enabled: bool, display: &mut D) {
        if enabled == self.overlay_enabled {
            return;
        }
        self.overlay_enabled = enabled;
        self.engine.set_enabled(enabled);
        debug!("Overlay {}", if enabled { "enabled" } else { "disabled" });

        if !enabled {
            if let Some(frame) = self.latest.as_ref() {
                display.on_frame_ready(frame);
            }
            return;
        }

        let Some(latest) = self.latest_frame_id() else {
            return;
        };
        if self.overlays.contains(latest) && self.show_pair(latest, display) {
            self.frames.remove_below(latest);
            self.overlays.remove_below(latest);
        } else {
            self.dispatch_latest(true);
        }
    }

    pub fn set_overlay_opacity(&mut self, opacity: f32) {
        self.opacity = clamp_opacity(opacity, self.opacity);
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn overlay_enabled(&self) -> bool {
        self.overlay_enabled
    }

    /// Id of the frame currently with the engine
    pub fn inflight(&self) -> Option<u64> {
        self.inflight
    }

    pub fn latest_frame_id(&self) -> Option<u64> {
        self.latest.as_ref().map(Frame::id)
    }

    /// Id of the last pair handed to the display
    pub fn last_shown(&self) -> Option<u64> {
        self.last_shown
    }

    pub fn cached_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn cached_overlays(&self) -> usize {
        self.overlays.len()
    }

    /// Frames and overlays pushed out of the caches by capacity
    pub fn cache_evictions(&self) -> u64 {
        self.evictions
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    fn resolve_inflight(&mut self, id: u64) {
        match self.inflight {
            Some(pending) if pending == id => self.inflight = None,
            Some(pending) => warn!("Result for frame {} while {} is in flight", id, pending),
            None => debug!("Result for frame {} with nothing in flight", id),
        }
    }

    fn count_evictions(&mut self, evicted: usize) {
        if evicted > 0 {
            self.evictions += evicted as u64;
            metrics::counter!("cache_evictions_total").increment(evicted as u64);
        }
    }

    fn show_pair<D: DisplaySurface + ?Sized>(&mut self, id: u64, display: &mut D) -> bool {
        let (Some(frame), Some(overlay)) = (self.frames.get(id), self.overlays.get(id)) else {
            return false;
        };
        let Some(pair) = DisplayPair::matched(frame.clone(), overlay.clone()) else {
            return false;
        };
        if let Some(overlay) = pair.overlay.as_ref() {
            display.on_pair_ready(&pair.frame, overlay, self.opacity);
        }
        self.last_shown = Some(id);
        metrics::counter!("pairs_displayed_total").increment(1);
        true
    }

    /// Send the newest frame to an idle engine. `repeat` allows resending a
    /// frame that was already dispatched once, used when overlays come back on.
    fn dispatch_latest(&mut self, repeat: bool) {
        if self.inflight.is_some() || !self.engine.is_idle() {
            return;
        }
        let Some(frame) = self.latest.as_ref() else {
            return;
        };
        let id = frame.id();
        let fresh = self.last_dispatched.map_or(true, |d| id > d);
        if !fresh && !repeat {
            return;
        }

        match self.engine.submit(frame) {
            Ok(()) => {
                trace!("Dispatched frame {}", id);
                self.inflight = Some(id);
                self.last_dispatched = Some(id);
            }
            Err(InferenceError::EngineBusy) => trace!("Engine busy, frame {} waits", id),
            Err(e) => warn!("Cannot dispatch frame {}: {}", id, e),
        }
    }
}

fn clamp_opacity(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct FakeEngine {
        pending: Cell<Option<u64>>,
        submitted: RefCell<Vec<u64>>,
        enabled: Cell<bool>,
        rejected: Cell<u32>,
    }

    impl FakeEngine {
        fn take(&self) -> Option<u64> {
            self.pending.take()
        }
    }

    impl InferenceDispatch for FakeEngine {
        fn submit(&self, frame: &Frame) -> Result<(), InferenceError> {
            if self.pending.get().is_some() {
                self.rejected.set(self.rejected.get() + 1);
                return Err(InferenceError::EngineBusy);
            }
            self.pending.set(Some(frame.id()));
            self.submitted.borrow_mut().push(frame.id());
            Ok(())
        }

        fn is_idle(&self) -> bool {
            self.pending.get().is_none()
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.set(enabled);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Shown {
        Raw(u64),
        Pair(u64, u64),
        Blank(bool),
        Error,
    }

    #[derive(Default)]
    struct Recorder {
        shown: Vec<Shown>,
    }

    impl Recorder {
        fn pairs(&self) -> Vec<u64> {
            self.shown
                .iter()
                .filter_map(|s| match s {
                    Shown::Pair(f, _) => Some(*f),
                    _ => None,
                })
                .collect()
        }
    }

    impl DisplaySurface for Recorder {
        fn on_frame_ready(&mut self, frame: &Frame) {
            self.shown.push(Shown::Raw(frame.id()));
        }

        fn on_pair_ready(&mut self, frame: &Frame, overlay: &Overlay, _opacity: f32) {
            self.shown.push(Shown::Pair(frame.id(), overlay.frame_id));
        }

        fn on_connectivity_changed(&mut self, _connected: bool) {}

        fn on_stream_finished(&mut self) {}

        fn on_error(&mut self, _message: &str) {
            self.shown.push(Shown::Error);
        }

        fn on_signal_blank(&mut self, blank: bool) {
            self.shown.push(Shown::Blank(blank));
        }
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, RgbImage::from_pixel(4, 4, Rgb([90, 40, 40])))
    }

    fn overlay(id: u64) -> Overlay {
        Overlay::from_image(id, RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 200])))
    }

    fn coordinator(enabled: bool) -> SyncCoordinator<FakeEngine> {
        SyncCoordinator::new(
            FakeEngine::default(),
            CoordinatorOptions {
                cache_capacity: 4,
                overlay_enabled: enabled,
                opacity: 0.7,
                passthrough_while_pending: false,
            },
        )
    }

    /// Complete the engine's current request
    fn finish(coord: &mut SyncCoordinator<FakeEngine>, display: &mut Recorder) -> Option<u64> {
        let id = coord.engine().take()?;
        coord.on_overlay(overlay(id), display);
        Some(id)
    }

    #[test]
    fn slow_engine_skips_to_newest_frame() {
        // frames every 30ms, inference takes 100ms
        let mut coord = coordinator(true);
        let mut display = Recorder::default();

        coord.on_frame(frame(1), &mut display);
        assert_eq!(coord.inflight(), Some(1));
        coord.on_frame(frame(2), &mut display);
        coord.on_frame(frame(3), &mut display);
        assert_eq!(coord.latest_frame_id(), Some(3));
        assert_eq!(coord.inflight(), Some(1));

        assert_eq!(finish(&mut coord, &mut display), Some(1));
        assert_eq!(coord.inflight(), Some(3));

        coord.on_frame(frame(4), &mut display);
        coord.on_frame(frame(5), &mut display);
        assert_eq!(finish(&mut coord, &mut display), Some(3));
        assert_eq!(finish(&mut coord, &mut display), Some(5));

        assert_eq!(*coord.engine().submitted.borrow(), vec![1, 3, 5]);
        assert_eq!(display.pairs(), vec![1, 3, 5]);
        assert_eq!(coord.engine().rejected.get(), 0);
        assert!(display.shown.iter().all(|s| !matches!(s, Shown::Raw(_))));
    }

    #[test]
    fn pair_cleanup_drops_older_entries() {
        let mut coord = coordinator(true);
        let mut display = Recorder::default();
        for id in 1..=3 {
            coord.on_frame(frame(id), &mut display);
        }
        finish(&mut coord, &mut display);
        finish(&mut coord, &mut display);
        assert_eq!(coord.last_shown(), Some(3));
        assert_eq!(coord.cached_frames(), 1);
        assert_eq!(coord.cached_overlays(), 1);
    }

    #[test]
    fn inflight_frame_is_never_evicted() {
        let mut coord = coordinator(true);
        let mut display = Recorder::default();
        for id in 1..=20 {
            coord.on_frame(frame(id), &mut display);
        }
        assert_eq!(coord.cached_frames(), 4);
        assert_eq!(coord.cache_evictions(), 16);
        assert_eq!(finish(&mut coord, &mut display), Some(1));
        assert_eq!(display.pairs(), vec![1]);
        assert_eq!(coord.inflight(), Some(20));
    }

    #[test]
    fn failure_frees_engine_for_next_frame() {
        let mut coord = coordinator(true);
        let mut display = Recorder::default();
        coord.on_frame(frame(1), &mut display);
        let id = coord.engine().take().unwrap();
        coord.on_inference_failed(id, "forward failed", &mut display);
        assert_eq!(coord.inflight(), None);
        assert!(display.shown.contains(&Shown::Error));

        // the failed frame is not retried; the next one goes out
        assert_eq!(*coord.engine().submitted.borrow(), vec![1]);
        coord.on_frame(frame(2), &mut display);
        assert_eq!(coord.inflight(), Some(2));
    }

    #[test]
    fn disabled_shows_raw_frames_and_swallows_late_overlay() {
        let mut coord = coordinator(true);
        let mut display = Recorder::default();
        coord.on_frame(frame(1), &mut display);
        coord.set_overlay_enabled(false, &mut display);
        assert!(!coord.engine().enabled.get());

        coord.on_frame(frame(2), &mut display);
        finish(&mut coord, &mut display);
        coord.on_frame(frame(3), &mut display);

        assert_eq!(coord.inflight(), None);
        assert!(display.pairs().is_empty());
        assert_eq!(
            display.shown.iter().filter(|s| matches!(s, Shown::Raw(_))).count(),
            3
        );
        assert_eq!(*coord.engine().submitted.borrow(), vec![1]);
    }

    #[test]
    fn reenable_shows_cached_pair_or_dispatches() {
        let mut coord = coordinator(true);
        let mut display = Recorder::default();
        coord.on_frame(frame(1), &mut display);
        coord.set_overlay_enabled(false, &mut display);
        finish(&mut coord, &mut display);

        // overlay for the latest frame arrived while off
        coord.set_overlay_enabled(true, &mut display);
        assert_eq!(display.pairs(), vec![1]);
        assert_eq!(coord.inflight(), None);

        coord.set_overlay_enabled(false, &mut display);
        coord.on_frame(frame(2), &mut display);
        coord.set_overlay_enabled(true, &mut display);
        assert_eq!(coord.inflight(), Some(2));
        finish(&mut coord, &mut display);
        assert_eq!(display.pairs(), vec![1, 2]);
    }

    #[test]
    fn reenable_before_any_frame_is_harmless() {
        let mut coord = coordinator(false);
        let mut display = Recorder::default();
        coord.set_overlay_enabled(true, &mut display);
        assert_eq!(coord.inflight(), None);
        assert!(display.shown.is_empty());
    }

    #[test]
    fn passthrough_forwards_raw_frames_too() {
        let mut coord = SyncCoordinator::new(
            FakeEngine::default(),
            CoordinatorOptions {
                cache_capacity: 4,
                overlay_enabled: true,
                opacity: 1.0,
                passthrough_while_pending: true,
            },
        );
        let mut display = Recorder::default();
        coord.on_frame(frame(1), &mut display);
        coord.on_frame(frame(2), &mut display);
        finish(&mut coord, &mut display);
        assert_eq!(
            display.shown[1..],
            [Shown::Raw(1), Shown::Raw(2), Shown::Pair(1, 1)]
        );
    }

    #[test]
    fn opacity_is_clamped() {
        let mut coord = coordinator(true);
        coord.set_overlay_opacity(1.7);
        assert_eq!(coord.opacity(), 1.0);
        coord.set_overlay_opacity(-0.2);
        assert_eq!(coord.opacity(), 0.0);
        coord.set_overlay_opacity(f32::NAN);
        assert_eq!(coord.opacity(), 0.0);
    }

    #[test]
    fn blank_signal_reported_on_transitions() {
        let mut coord = coordinator(false);
        let mut display = Recorder::default();
        let black = |id| Frame::new(id, RgbImage::new(8, 8));
        coord.on_frame(black(1), &mut display);
        coord.on_frame(black(2), &mut display);
        coord.on_frame(frame(3), &mut display);
        let blanks: Vec<_> = display
            .shown
            .iter()
            .filter(|s| matches!(s, Shown::Blank(_)))
            .cloned()
            .collect();
        assert_eq!(blanks, vec![Shown::Blank(true), Shown::Blank(false)]);
    }

    #[test]
    fn mismatched_ids_do_not_pair() {
        assert!(DisplayPair::matched(frame(2), overlay(3)).is_none());
        assert_eq!(DisplayPair::matched(frame(2), overlay(2)).unwrap().frame_id(), 2);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Frame,
        Complete,
        Fail,
        Toggle,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Frame),
            3 => Just(Step::Complete),
            1 => Just(Step::Fail),
            1 => Just(Step::Toggle),
        ]
    }

    proptest! {
        #[test]
        fn pairs_always_match_and_advance(steps in prop::collection::vec(step(), 1..200)) {
            let mut coord = coordinator(true);
            let mut display = Recorder::default();
            let mut next_id = 1;

            for step in steps {
                match step {
                    Step::Frame => {
                        coord.on_frame(frame(next_id), &mut display);
                        next_id += 1;
                    }
                    Step::Complete => {
                        finish(&mut coord, &mut display);
                    }
                    Step::Fail => {
                        if let Some(id) = coord.engine().take() {
                            coord.on_inference_failed(id, "boom", &mut display);
                        }
                    }
                    Step::Toggle => {
                        let enabled = !coord.overlay_enabled();
                        coord.set_overlay_enabled(enabled, &mut display);
                    }
                }
                prop_assert_eq!(coord.inflight(), coord.engine().pending.get());
            }

            prop_assert_eq!(coord.engine().rejected.get(), 0);
            let mut last = 0;
            for shown in &display.shown {
                if let Shown::Pair(frame_id, overlay_id) = shown {
                    prop_assert_eq!(frame_id, overlay_id);
                    // re-enabling may show the current pair again
                    prop_assert!(*frame_id >= last);
                    last = *frame_id;
                }
            }
        }
    }
}
