//! ONNX Runtime binding.

use std::fmt::Display;
use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

use crate::{EngineError, InferenceEngine, ModelSpec, Result};

fn load_err<E: Display>(e: E) -> EngineError {
    EngineError::Load(e.to_string())
}

fn infer_err<E: Display>(e: E) -> EngineError {
    EngineError::Inference(e.to_string())
}

/// One loaded ONNX model.
///
/// The weights are the only state shared between requests. The session is
/// locked for the duration of a call, the input tensor is moved in per call
/// and outputs are copied out before the lock is released.
pub struct OrtEngine {
    spec: ModelSpec,
    session: Mutex<Session>,
}

impl OrtEngine {
    /// Load and optimize the model at `path`, bound to `spec`.
    pub fn load(path: impl AsRef<Path>, spec: ModelSpec, intra_threads: usize) -> Result<Self> {
        let path = path.as_ref();
        spec.validate()?;

        info!(model = %spec.name, path = %path.display(), "loading ONNX model");
        let session = Session::builder()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(intra_threads.max(1))
            .map_err(load_err)?
            .commit_from_file(path)
            .map_err(|e| EngineError::Load(format!("{}: {e}", path.display())))?;

        debug!(
            model = %spec.name,
            input = %spec.input_name,
            outputs = ?spec.output_names(),
            "model ready"
        );

        Ok(Self {
            spec,
            session: Mutex::new(session),
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = Tensor::from_array(input).map_err(infer_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::Inference("session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![self.spec.input_name.as_str() => tensor])
            .map_err(infer_err)?;

        let mut arrays = Vec::with_capacity(self.spec.outputs.len());
        for declared in &self.spec.outputs {
            let value = outputs
                .get(declared.name.as_str())
                .ok_or_else(|| EngineError::MissingOutput(declared.name.clone()))?;
            let view = value.try_extract_array::<f32>().map_err(infer_err)?;
            arrays.push(view.to_owned());
        }
        Ok(arrays)
    }
}
