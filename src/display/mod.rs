//! Rendering boundary. The pipeline calls into a `DisplaySurface` on the UI thread.

pub mod compose;
pub mod snapshot;

use tracing::debug;

use crate::capture::Frame;
use crate::inference::Overlay;

pub use compose::{composite, Letterbox};
pub use snapshot::SnapshotSurface;

/// Receives frames, matched pairs and status notifications from the coordinator.
/// Implementations must not block; every call happens on the coordinating thread.
pub trait DisplaySurface {
    /// Show a frame without any overlay
    fn on_frame_ready(&mut self, frame: &Frame);

    /// Show a frame with its own overlay at `opacity` in [0, 1].
    /// `overlay.frame_id == frame.id()` always holds; sizes may differ.
    fn on_pair_ready(&mut self, frame: &Frame, overlay: &Overlay, opacity: f32);

    fn on_connectivity_changed(&mut self, connected: bool);

    /// A non-looping file reached its end
    fn on_stream_finished(&mut self);

    fn on_error(&mut self, message: &str);

    fn on_debug(&mut self, message: &str) {
        debug!("{}", message);
    }

    /// The incoming signal turned black (or recovered)
    fn on_signal_blank(&mut self, _blank: bool) {}
}
