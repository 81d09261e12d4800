pub mod engine;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod output;
pub mod overlay;
pub mod segmenter;

pub use engine::{model_loader, EngineMode, EngineStats, InferenceEngine, ModelLoader, PendingRequest};
#[cfg(feature = "onnx")]
pub use onnx::OnnxSegmenter;
pub use output::{to_probability, ModelOutput, OutputTensor, KNOWN_OUTPUT_KEYS};
pub use overlay::{build_overlay, Overlay, OverlayStyle, ProbabilityMap, Rgba};
pub use segmenter::{EdgeFallback, InputTensor, Segmenter};
