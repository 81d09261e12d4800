//! ONNX Runtime segmentation model

use std::fmt;
use std::path::Path;

use ort::session::Session;
use ort::value::Tensor;
use tracing::{info, warn};

use super::output::{ModelOutput, OutputTensor};
use super::segmenter::{InputTensor, Segmenter};
use crate::error::InferenceError;
use crate::{Device, ModelConfig};

pub struct OnnxSegmenter {
    session: Session,
    input_size: (u32, u32),
}

impl OnnxSegmenter {
    pub fn load(path: &Path, config: &ModelConfig) -> Result<Self, InferenceError> {
        if !path.is_file() {
            return Err(InferenceError::ModelLoad(format!(
                "{}: checkpoint not found",
                path.display()
            )));
        }

        let builder = Session::builder().map_err(load_err(path))?;
        let builder = match config.device {
            Device::Cpu => builder,
            #[cfg(feature = "cuda")]
            Device::Cuda => builder
                .with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default().build()
                ])
                .map_err(load_err(path))?,
            #[cfg(not(feature = "cuda"))]
            Device::Cuda => {
                warn!("CUDA requested but built without the cuda feature; using CPU");
                builder
            }
        };
        let session = builder.commit_from_file(path).map_err(load_err(path))?;

        info!(
            "Segmentation model loaded from {} ({:?}, input {}x{})",
            path.display(),
            config.device,
            config.input_width,
            config.input_height
        );

        Ok(Self {
            session,
            input_size: config.input_size(),
        })
    }
}

fn load_err<E: fmt::Display>(path: &Path) -> impl Fn(E) -> InferenceError + '_ {
    move |e| InferenceError::ModelLoad(format!("{}: {e}", path.display()))
}

impl Segmenter for OnnxSegmenter {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn forward(&mut self, input: &InputTensor) -> Result<ModelOutput, InferenceError> {
        let tensor = Tensor::from_array((input.shape(), input.data.clone())).map_err(|e| InferenceError::Forward(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| InferenceError::Forward(e.to_string()))?;

        let mut named = Vec::new();
        for (name, value) in outputs.iter() {
            match value.try_extract_tensor::<f32>() {
                Ok((shape, data)) => {
                    let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
                    named.push((name.to_string(), OutputTensor::new(shape, data.to_vec())?));
                }
                Err(e) => warn!("Skipping non-f32 output {}: {}", name, e),
            }
        }

        match named.len() {
            1 => Ok(ModelOutput::Tensor(named.remove(0).1)),
            _ => Ok(ModelOutput::Named(named)),
        }
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
