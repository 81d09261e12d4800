pub mod annotations;
mod cache;
pub mod controller;
pub mod coordinator;

use crate::capture::Frame;
use crate::inference::{EngineMode, Overlay};

pub use annotations::{Annotation, AnnotationLog};
pub use controller::Pipeline;
pub use coordinator::{CoordinatorOptions, DisplayPair, InferenceDispatch, SyncCoordinator};

/// Everything the capture and inference threads report to the coordinating thread.
/// Delivered in FIFO order per sending thread.
#[derive(Debug)]
pub enum PipelineEvent {
    Frame(Frame),
    Connectivity(bool),
    StreamFinished,
    SourceError(String),
    OverlayReady(Overlay),
    InferenceFailed { frame_id: u64, message: String },
    ModelLoadFailed(String),
    EngineReady(EngineMode),
}

pub type EventSender = flume::Sender<PipelineEvent>;
pub type EventReceiver = flume::Receiver<PipelineEvent>;
