// disco-detect/src/lib.rs
// ============================================================
// disco-detect  –  decode / NMS / embedding stage
// Turns raw engine output back into geometry: object boxes with
// a class, face boxes, unit-length face embeddings.
// ------------------------------------------------------------
// Pipeline: bytes → RgbImage → Array4<f32> → engine → decode → NMS
// ------------------------------------------------------------
// Public API
//   * ObjectDetector::detect(img)   – Vec<Detection>
//   * FaceDetector::detect(img)     – Vec<Face>
//   * FaceEmbedder::embed(tensor)   – Vec<f32>, ‖v‖ = 1
//   * FaceProcessor::process(img)   – faces + embeddings
//   * suppress(boxes, iou)          – greedy NMS over any `Scored`
// ------------------------------------------------------------
// All decode / NMS functions are pure. The engine behind the
// pipelines is the only shared resource; see disco-model.
// ============================================================

//! disco – detection layer
//!
//! Decoders are selected from the [`ModelKind`](disco_model::ModelKind) the
//! engine was loaded with, never from output names. Every tensor is checked
//! against the model's shape table before it is indexed.
//!
//! Boxes are reported in model-input pixels. [`disco_preprocess::Transform`]
//! maps them back to the source frame when a caller needs that.

use disco_model::EngineError;
use disco_preprocess::PreprocessError;
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod embedding;
pub mod face;
pub mod nms;
pub mod object;
pub mod pipeline;

pub use embedding::{cosine_similarity, decode_embedding, l2_normalize};
pub use face::{decode_dense, decode_multi_head, FaceDecodeParams};
pub use nms::{iou, suppress, Scored};
pub use object::decode_detections;
pub use pipeline::{
    DetectParams, Detector, FaceEmbedder, FaceParams, FaceDetector, FaceProcessor,
    ObjectDetector, Timed,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("tensor has shape {actual:?}, expected {expected}")]
    TensorShapeMismatch { expected: String, actual: Vec<usize> },
    #[error("expected {expected} head tensors, got {actual}")]
    HeadCount { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("preprocess failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("model `{model}` cannot be used as a {expected}")]
    WrongModel { model: String, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// Failure classes callers branch on (HTTP status, metrics, logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidImage,
    UnsupportedFormat,
    InvalidCrop,
    InferenceFailure,
    Timeout,
    Busy,
    TensorShapeMismatch,
    Configuration,
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectError::Preprocess(PreprocessError::InvalidImage(_)) => ErrorKind::InvalidImage,
            DetectError::Preprocess(PreprocessError::UnsupportedFormat(_)) => {
                ErrorKind::UnsupportedFormat
            }
            DetectError::Preprocess(PreprocessError::InvalidCrop { .. }) => ErrorKind::InvalidCrop,
            DetectError::Engine(EngineError::Timeout(_)) => ErrorKind::Timeout,
            DetectError::Engine(EngineError::Busy(_)) => ErrorKind::Busy,
            DetectError::Engine(
                EngineError::TensorShapeMismatch { .. } | EngineError::MissingOutput(_),
            ) => ErrorKind::TensorShapeMismatch,
            DetectError::Engine(EngineError::Inference(_)) => ErrorKind::InferenceFailure,
            DetectError::Engine(EngineError::Load(_) | EngineError::Config(_)) => {
                ErrorKind::Configuration
            }
            DetectError::Decode(_) => ErrorKind::TensorShapeMismatch,
            DetectError::WrongModel { .. } => ErrorKind::Configuration,
        }
    }
}

/// One object: class index, confidence, `[x1, y1, x2, y2]` in model-input pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: usize,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// One face box; `embedding` is unit length when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Face {
    pub fn new(bbox: [f32; 4], score: f32) -> Self {
        let [x1, y1, x2, y2] = bbox;
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            embedding: None,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Whether decoded boxes are clamped to the model canvas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Leave coordinates as the model produced them.
    #[default]
    None,
    /// Clamp x into `[0, width]` and y into `[0, height]`.
    Frame { width: f32, height: f32 },
}

impl ClampPolicy {
    pub fn apply(self, bbox: [f32; 4]) -> [f32; 4] {
        match self {
            ClampPolicy::None => bbox,
            ClampPolicy::Frame { width, height } => {
                let [x1, y1, x2, y2] = bbox;
                [
                    x1.max(0.0).min(width),
                    y1.max(0.0).min(height),
                    x2.max(0.0).min(width),
                    y2.max(0.0).min(height),
                ]
            }
        }
    }
}

/// `(cx, cy, w, h)` → `[x1, y1, x2, y2]`
#[inline]
pub fn center_to_corners(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// View a `[1, A, B]` or `[A, B]` tensor as an `A × B` matrix.
pub(crate) fn squeeze_batch<'a>(
    output: ArrayViewD<'a, f32>,
    expected: impl FnOnce() -> String,
) -> std::result::Result<ArrayView2<'a, f32>, DecodeError> {
    let actual = output.shape().to_vec();
    let output = if output.ndim() == 3 && actual[0] == 1 {
        output.index_axis_move(Axis(0), 0)
    } else {
        output
    };
    output
        .into_dimensionality::<Ix2>()
        .map_err(|_| DecodeError::TensorShapeMismatch {
            expected: expected(),
            actual,
        })
}
