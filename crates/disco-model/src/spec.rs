//! Static model descriptions.
//!
//! A [`ModelSpec`] is picked once when the server starts (preset or JSON
//! file) and carries everything the pipelines need: which codec policy to
//! use, which decoder applies, and the exact shape of every output tensor.

use std::path::Path;

use disco_preprocess::{CodecConfig, Normalization};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

/// How a multi-head bbox row is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadBoxEncoding {
    /// Center-form `cx, cy, w, h` already in model-input pixels.
    #[default]
    Pixel,
    /// Grid offsets: `cx = (col + dx) * stride`, `w = exp(dw) * stride`.
    Grid,
}

/// Decode variant, selected at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    /// One `[1, 4 + num_classes, anchors]` tensor.
    ObjectDetector { num_classes: usize },
    /// One `[1, candidates, row_len]` tensor of normalized center boxes.
    FaceDense { row_len: usize },
    /// `3 × strides.len()` tensors, role-major: all class heads, then all
    /// objectness heads, then all bbox heads, each in `strides` order.
    FaceMultiHead {
        strides: Vec<u32>,
        #[serde(default)]
        encoding: HeadBoxEncoding,
    },
    /// One `[1, dim]` embedding.
    FaceEmbedder { dim: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    pub input_name: String,
    pub codec: CodecConfig,
    pub outputs: Vec<OutputSpec>,
}

/// Anchors of a stride-8/16/32 head set on a square canvas.
fn anchor_count(size: u32, strides: &[u32]) -> usize {
    strides
        .iter()
        .map(|&s| ((size / s) * (size / s)) as usize)
        .sum()
}

impl ModelSpec {
    pub const FACE_STRIDES: [u32; 3] = [8, 16, 32];

    /// YOLOv8 COCO detector: `images` → `output0 [1, 84, 8400]` at 640.
    pub fn yolov8(size: u32) -> Self {
        let num_classes = 80;
        let anchors = anchor_count(size, &Self::FACE_STRIDES);
        Self {
            name: "yolov8n".into(),
            kind: ModelKind::ObjectDetector { num_classes },
            input_name: "images".into(),
            codec: CodecConfig::stretch(size, size),
            outputs: vec![OutputSpec::new("output0", [1, 4 + num_classes, anchors])],
        }
    }

    /// YuNet-style detector with separate class / objectness / bbox heads.
    pub fn face_multi_head(size: u32) -> Self {
        let strides = Self::FACE_STRIDES;
        let mut outputs = Vec::with_capacity(strides.len() * 3);
        for (role, width) in [("cls", 1), ("obj", 1), ("bbox", 4)] {
            for &stride in &strides {
                let anchors = anchor_count(size, &[stride]);
                outputs.push(OutputSpec::new(
                    format!("{role}_{stride}"),
                    [1, anchors, width],
                ));
            }
        }

        Self {
            name: "yunet".into(),
            kind: ModelKind::FaceMultiHead {
                strides: strides.to_vec(),
                encoding: HeadBoxEncoding::Pixel,
            },
            input_name: "input".into(),
            codec: CodecConfig::letterbox(size, size, 0.0),
            outputs,
        }
    }

    /// Single-tensor face detector: `input` 320×320 → `output [1, 5600, 14]`.
    pub fn face_dense() -> Self {
        Self {
            name: "face-dense".into(),
            kind: ModelKind::FaceDense { row_len: 14 },
            input_name: "input".into(),
            codec: CodecConfig::letterbox(320, 320, 0.0),
            outputs: vec![OutputSpec::new("output", [1, 5600, 14])],
        }
    }

    /// MobileFaceNet-style embedder: 112×112 in [-1,1] → `[1, 128]`.
    pub fn face_embedder() -> Self {
        Self {
            name: "mobilefacenet".into(),
            kind: ModelKind::FaceEmbedder { dim: 128 },
            input_name: "input".into(),
            codec: CodecConfig::letterbox(112, 112, 0.5)
                .with_normalization(Normalization::Symmetric),
            outputs: vec![OutputSpec::new("output", [1, 128])],
        }
    }

    /// Read a spec from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let spec: Self = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check that the output table is consistent with the decode variant.
    pub fn validate(&self) -> Result<()> {
        let expected_outputs = match &self.kind {
            ModelKind::FaceMultiHead { strides, .. } => strides.len() * 3,
            _ => 1,
        };
        if self.outputs.len() != expected_outputs {
            return Err(EngineError::Config(format!(
                "{} declares {} outputs, its decoder needs {}",
                self.name,
                self.outputs.len(),
                expected_outputs
            )));
        }
        if self.codec.width == 0 || self.codec.height == 0 {
            return Err(EngineError::Config(format!(
                "{} has an empty input canvas",
                self.name
            )));
        }
        Ok(())
    }

    /// `[1, 3, H, W]`
    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.codec.height as usize, self.codec.width as usize]
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.name.as_str()).collect()
    }

    /// Compare engine outputs against the declared shape table.
    pub fn validate_outputs(&self, outputs: &[ArrayD<f32>]) -> Result<()> {
        if outputs.len() < self.outputs.len() {
            return Err(EngineError::MissingOutput(
                self.outputs[outputs.len()].name.clone(),
            ));
        }
        for (declared, actual) in self.outputs.iter().zip(outputs) {
            if actual.shape() != declared.shape.as_slice() {
                return Err(EngineError::TensorShapeMismatch {
                    name: declared.name.clone(),
                    expected: declared.shape.clone(),
                    actual: actual.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yolov8_shape_table() {
        let spec = ModelSpec::yolov8(640);
        assert_eq!(spec.input_shape(), [1, 3, 640, 640]);
        assert_eq!(spec.outputs[0].shape, vec![1, 84, 8400]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn multi_head_table_is_role_major() {
        let spec = ModelSpec::face_multi_head(640);
        assert_eq!(
            spec.output_names(),
            vec![
                "cls_8", "cls_16", "cls_32", "obj_8", "obj_16", "obj_32", "bbox_8", "bbox_16",
                "bbox_32"
            ]
        );
        assert_eq!(spec.outputs[0].shape, vec![1, 6400, 1]);
        assert_eq!(spec.outputs[4].shape, vec![1, 1600, 1]);
        assert_eq!(spec.outputs[8].shape, vec![1, 400, 4]);
    }

    #[test]
    fn validate_catches_short_table() {
        let mut spec = ModelSpec::face_multi_head(640);
        spec.outputs.truncate(6);
        assert!(matches!(spec.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn missing_output_is_reported_by_name() {
        let spec = ModelSpec::face_multi_head(320);
        let outputs = vec![ArrayD::<f32>::zeros(vec![1, 1600, 1])];
        match spec.validate_outputs(&outputs) {
            Err(EngineError::MissingOutput(name)) => assert_eq!(name, "cls_16"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
