//! # disco-model
//!
//! The boundary between the pipelines and the inference engine.
//!
//! ## Features
//!
//! - [`ModelSpec`]: static description of one model (input name, canvas and
//!   codec policy, ordered output shape table, decode variant). Chosen once at
//!   load time; nothing is inferred from output names per call.
//! - [`InferenceEngine`]: `run(tensor) -> outputs`, the only operation the rest
//!   of the workspace needs from an engine.
//! - [`OrtEngine`]: ONNX Runtime binding. The session sits behind a mutex so
//!   calls into one model instance are serialized; tensors are allocated per
//!   call and never shared.
//! - [`Deadline`]: runs any engine on one dedicated worker thread and turns
//!   a stuck call into [`EngineError::Timeout`], or [`EngineError::Busy`]
//!   when calls are already queued behind it.

use std::time::Duration;

use ndarray::{Array4, ArrayD};
use thiserror::Error;

pub mod deadline;
pub mod onnx;
pub mod spec;

pub use deadline::Deadline;
pub use onnx::OrtEngine;
pub use spec::{HeadBoxEncoding, ModelKind, ModelSpec, OutputSpec};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("invalid model config: {0}")]
    Config(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("inference exceeded deadline of {0:?}")]
    Timeout(Duration),
    #[error("model `{0}` is busy")]
    Busy(String),
    #[error("output `{0}` missing from engine result")]
    MissingOutput(String),
    #[error("tensor `{name}` has shape {actual:?}, expected {expected:?}")]
    TensorShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Anything that can execute a model on a `1×3×H×W` tensor.
///
/// Outputs come back in the order of [`ModelSpec::outputs`].
pub trait InferenceEngine: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>>;

    /// [`run`](Self::run) with the input and every output checked against the
    /// spec's shape table before anyone indexes into them.
    fn run_checked(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let spec = self.spec();
        let expected = spec.input_shape();
        if input.shape() != expected.as_slice() {
            return Err(EngineError::TensorShapeMismatch {
                name: spec.input_name.clone(),
                expected: expected.to_vec(),
                actual: input.shape().to_vec(),
            });
        }

        let outputs = self.run(input)?;
        spec.validate_outputs(&outputs)?;
        Ok(outputs)
    }
}
