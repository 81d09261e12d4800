//! Selecting the segmentation tensor out of whatever a model returns

use super::overlay::ProbabilityMap;
use crate::error::InferenceError;

/// Keys recognized in named outputs, in order of preference
pub const KNOWN_OUTPUT_KEYS: [&str; 7] =
    ["mask", "pred", "out", "logits", "probs", "prediction", "seg_logits"];

/// Dense f32 tensor with a row-major shape
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, InferenceError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(InferenceError::Shape(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// Model output as produced by the runtime
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Tensor(OutputTensor),
    /// Positional outputs (auxiliary heads, feature maps, ...)
    Tuple(Vec<OutputTensor>),
    /// Outputs addressed by name, in the model's declared order
    Named(Vec<(String, OutputTensor)>),
}

impl ModelOutput {
    /// Pick the segmentation tensor:
    /// - a single tensor is used as is
    /// - a tuple yields its last 4-D tensor, else its last tensor
    /// - a mapping yields the first of [`KNOWN_OUTPUT_KEYS`] present, else it is
    ///   read positionally like a tuple
    pub fn select(self) -> Result<OutputTensor, InferenceError> {
        match self {
            ModelOutput::Tensor(t) => Ok(t),
            ModelOutput::Tuple(tensors) => last_spatial(tensors)
                .ok_or_else(|| InferenceError::Output("model returned an empty tuple".into())),
            ModelOutput::Named(mut entries) => {
                let known = KNOWN_OUTPUT_KEYS
                    .iter()
                    .find_map(|key| entries.iter().position(|(name, _)| name == key));
                if let Some(pos) = known {
                    return Ok(entries.swap_remove(pos).1);
                }
                last_spatial(entries.into_iter().map(|(_, t)| t).collect()).ok_or_else(|| {
                    InferenceError::Output("model returned a mapping without tensors".into())
                })
            }
        }
    }
}

fn last_spatial(mut tensors: Vec<OutputTensor>) -> Option<OutputTensor> {
    match tensors.iter().rposition(|t| t.ndim() == 4) {
        Some(pos) => Some(tensors.swap_remove(pos)),
        None => tensors.pop(),
    }
}

/// Reduce a selected tensor to an H×W probability map.
///
/// Values outside [-0.5, 1.5] anywhere in the tensor mark it as logits, and the
/// first plane then gets a sigmoid. 4-D tensors use batch 0, channel 0; 3-D
/// tensors their first plane.
pub fn to_probability(tensor: &OutputTensor) -> Result<ProbabilityMap, InferenceError> {
    let (height, width) = match tensor.shape.as_slice() {
        [_, _, h, w] | [_, h, w] | [h, w] => (*h, *w),
        other => {
            return Err(InferenceError::Shape(format!(
                "cannot read a mask from shape {other:?}"
            )))
        }
    };
    let plane = width * height;
    if plane == 0 || tensor.data.len() < plane {
        return Err(InferenceError::Shape(format!(
            "empty mask plane in shape {:?}",
            tensor.shape
        )));
    }

    let (min, max) = tensor
        .data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let logits = max > 1.5 || min < -0.5;

    let data = tensor.data[..plane]
        .iter()
        .map(|&v| {
            let p = if logits { sigmoid(v) } else { v };
            if p.is_nan() {
                0.0
            } else {
                p.clamp(0.0, 1.0)
            }
        })
        .collect();

    Ok(ProbabilityMap {
        width: width as u32,
        height: height as u32,
        data,
    })
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
