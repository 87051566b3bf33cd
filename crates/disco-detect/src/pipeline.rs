//! End-to-end pipelines: bytes or frame in, geometry out.
//!
//! Each pipeline owns an `Arc<dyn InferenceEngine>` and checks the engine's
//! [`ModelKind`] once, at construction. After that every call is
//! preprocess → `run_checked` → decode → NMS, with a fresh tensor per call.

use std::sync::Arc;
use std::time::Instant;

use disco_model::{HeadBoxEncoding, InferenceEngine, ModelKind};
use disco_preprocess::{crop_face, decode_image, Preprocessor, Transform};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::decode_embedding;
use crate::face::{decode_dense, decode_multi_head, FaceDecodeParams};
use crate::nms::suppress;
use crate::object::decode_detections;
use crate::{ClampPolicy, DetectError, Detection, Face, Result};

/// A result plus the wall time it took, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timed<T> {
    pub value: T,
    pub latency_ms: f64,
}

impl<T> Timed<T> {
    fn since(start: Instant, value: T) -> Self {
        Self {
            value,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// Trait for anything that finds boxes in a frame.
pub trait Detector {
    type Output;

    fn detect(&self, image: &RgbImage) -> Result<Vec<Self::Output>>;
}

fn wrong_model(engine: &dyn InferenceEngine, expected: &'static str) -> DetectError {
    DetectError::WrongModel {
        model: engine.spec().name.clone(),
        expected,
    }
}

// ------------------------------------------------------------
// object detection
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectParams {
    pub conf_threshold: f32,
    /// NMS is skipped unless set.
    pub iou_threshold: Option<f32>,
    pub clamp: ClampPolicy,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            iou_threshold: None,
            clamp: ClampPolicy::None,
        }
    }
}

pub struct ObjectDetector {
    engine: Arc<dyn InferenceEngine>,
    preprocessor: Preprocessor,
    num_classes: usize,
    params: DetectParams,
}

impl ObjectDetector {
    pub fn new(engine: Arc<dyn InferenceEngine>, params: DetectParams) -> Result<Self> {
        let num_classes = match engine.spec().kind {
            ModelKind::ObjectDetector { num_classes } => num_classes,
            _ => return Err(wrong_model(engine.as_ref(), "object detector")),
        };
        engine.spec().validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(engine.spec().codec),
            engine,
            num_classes,
            params,
        })
    }

    pub fn params(&self) -> &DetectParams {
        &self.params
    }

    pub fn detect_bytes(&self, bytes: &[u8]) -> Result<Timed<Vec<Detection>>> {
        let start = Instant::now();
        let image = decode_image(bytes)?;
        let detections = self.detect(&image)?;
        Ok(Timed::since(start, detections))
    }
}

impl Detector for ObjectDetector {
    type Output = Detection;

    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let encoded = self.preprocessor.run(image)?;
        let outputs = self.engine.run_checked(encoded.tensor)?;

        let mut detections = decode_detections(
            outputs[0].view(),
            self.num_classes,
            self.params.conf_threshold,
            self.params.clamp,
        )?;
        if let Some(iou) = self.params.iou_threshold {
            detections = suppress(detections, iou);
        }

        debug!(
            model = %self.engine.spec().name,
            count = detections.len(),
            "object detection done"
        );
        Ok(detections)
    }
}

// ------------------------------------------------------------
// face detection
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceParams {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub min_size: f32,
}

impl Default for FaceParams {
    fn default() -> Self {
        Self {
            conf_threshold: 0.6,
            iou_threshold: 0.4,
            min_size: 10.0,
        }
    }
}

enum FaceLayout {
    Dense { row_len: usize },
    MultiHead {
        strides: Vec<u32>,
        encoding: HeadBoxEncoding,
    },
}

pub struct FaceDetector {
    engine: Arc<dyn InferenceEngine>,
    preprocessor: Preprocessor,
    layout: FaceLayout,
    params: FaceParams,
}

impl FaceDetector {
    pub fn new(engine: Arc<dyn InferenceEngine>, params: FaceParams) -> Result<Self> {
        let layout = match &engine.spec().kind {
            ModelKind::FaceDense { row_len } => FaceLayout::Dense { row_len: *row_len },
            ModelKind::FaceMultiHead { strides, encoding } => FaceLayout::MultiHead {
                strides: strides.clone(),
                encoding: *encoding,
            },
            _ => return Err(wrong_model(engine.as_ref(), "face detector")),
        };
        engine.spec().validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(engine.spec().codec),
            engine,
            layout,
            params,
        })
    }

    pub fn params(&self) -> &FaceParams {
        &self.params
    }

    /// Faces in model-input pixels, plus the transform that maps them back
    /// onto `image`.
    pub fn detect_with_transform(&self, image: &RgbImage) -> Result<(Vec<Face>, Transform)> {
        let encoded = self.preprocessor.run(image)?;
        let codec = self.preprocessor.config();
        let mut decode = FaceDecodeParams::new(self.params.conf_threshold, codec.width, codec.height);
        decode.min_size = self.params.min_size;

        let outputs = self.engine.run_checked(encoded.tensor)?;
        let candidates = match &self.layout {
            FaceLayout::Dense { row_len } => decode_dense(outputs[0].view(), *row_len, &decode)?,
            FaceLayout::MultiHead { strides, encoding } => {
                decode_multi_head(&outputs, strides, *encoding, &decode)?
            }
        };
        let candidates_len = candidates.len();
        let faces = suppress(candidates, self.params.iou_threshold);

        debug!(
            model = %self.engine.spec().name,
            candidates = candidates_len,
            kept = faces.len(),
            "face detection done"
        );
        Ok((faces, encoded.transform))
    }
}

impl Detector for FaceDetector {
    type Output = Face;

    fn detect(&self, image: &RgbImage) -> Result<Vec<Face>> {
        self.detect_with_transform(image).map(|(faces, _)| faces)
    }
}

// ------------------------------------------------------------
// face embedding
// ------------------------------------------------------------

#[derive(Clone)]
pub struct FaceEmbedder {
    engine: Arc<dyn InferenceEngine>,
    preprocessor: Preprocessor,
    dim: usize,
}

impl FaceEmbedder {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let dim = match engine.spec().kind {
            ModelKind::FaceEmbedder { dim } => dim,
            _ => return Err(wrong_model(engine.as_ref(), "face embedder")),
        };
        engine.spec().validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(engine.spec().codec),
            engine,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Run an already encoded crop; the result has unit length.
    pub fn embed(&self, tensor: Array4<f32>) -> Result<Vec<f32>> {
        let outputs = self.engine.run_checked(tensor)?;
        Ok(decode_embedding(outputs[0].view(), self.dim)?)
    }

    /// Letterbox `crop` onto the embedder canvas and embed it.
    pub fn embed_image(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let encoded = self.preprocessor.run(crop)?;
        self.embed(encoded.tensor)
    }

    /// Embed `face`, given in detector-input pixels, cut out of `frame`.
    pub fn embed_face(&self, frame: &RgbImage, face: &Face, transform: &Transform) -> Result<Vec<f32>> {
        let (x1, y1) = transform.to_source(face.x1, face.y1);
        let (x2, y2) = transform.to_source(face.x2, face.y2);
        let crop = crop_face(frame, [x1, y1, x2, y2])?;
        self.embed_image(&crop)
    }

    /// Decode `bytes` and embed the whole image as one crop.
    pub fn embed_bytes(&self, bytes: &[u8]) -> Result<Timed<Vec<f32>>> {
        let start = Instant::now();
        let image = decode_image(bytes)?;
        let embedding = self.embed_image(&image)?;
        Ok(Timed::since(start, embedding))
    }
}

// ------------------------------------------------------------
// detect + embed
// ------------------------------------------------------------

/// Face detection followed by an embedding per face.
pub struct FaceProcessor {
    detector: FaceDetector,
    embedder: Option<FaceEmbedder>,
}

impl FaceProcessor {
    pub fn new(detector: FaceDetector, embedder: Option<FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn embedder(&self) -> Option<&FaceEmbedder> {
        self.embedder.as_ref()
    }

    /// Faces that fail to crop or embed are returned without an embedding.
    pub fn process(&self, image: &RgbImage) -> Result<Vec<Face>> {
        let (mut faces, transform) = self.detector.detect_with_transform(image)?;
        let Some(embedder) = &self.embedder else {
            return Ok(faces);
        };

        for (i, face) in faces.iter_mut().enumerate() {
            match embedder.embed_face(image, face, &transform) {
                Ok(embedding) => face.embedding = Some(embedding),
                Err(e) => warn!(face = i, error = %e, "skipping face embedding"),
            }
        }
        Ok(faces)
    }

    pub fn process_bytes(&self, bytes: &[u8]) -> Result<Timed<Vec<Face>>> {
        let start = Instant::now();
        let image = decode_image(bytes)?;
        let faces = self.process(&image)?;
        Ok(Timed::since(start, faces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disco_model::{EngineError, ModelSpec};
    use image::Rgb;
    use ndarray::{Array2, Array3, ArrayD};

    /// Returns canned outputs and ignores the input.
    struct Canned {
        spec: ModelSpec,
        outputs: Vec<ArrayD<f32>>,
    }

    impl InferenceEngine for Canned {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        fn run(&self, _input: Array4<f32>) -> disco_model::Result<Vec<ArrayD<f32>>> {
            Ok(self.outputs.clone())
        }
    }

    fn frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([90, 120, 150]))
    }

    fn dense_engine(rows: &[[f32; 5]]) -> Arc<dyn InferenceEngine> {
        let mut out = Array3::<f32>::zeros((1, 5600, 14));
        for (i, r) in rows.iter().enumerate() {
            for (j, &v) in r.iter().enumerate() {
                out[[0, i, j]] = v;
            }
        }
        Arc::new(Canned {
            spec: ModelSpec::face_dense(),
            outputs: vec![out.into_dyn()],
        })
    }

    fn embedder_engine() -> Arc<dyn InferenceEngine> {
        Arc::new(Canned {
            spec: ModelSpec::face_embedder(),
            outputs: vec![Array2::<f32>::from_elem((1, 128), 1.0).into_dyn()],
        })
    }

    #[test]
    fn wrong_model_is_rejected() {
        let err = ObjectDetector::new(embedder_engine(), DetectParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, DetectError::WrongModel { .. }));
        assert!(FaceDetector::new(embedder_engine(), FaceParams::default()).is_err());
    }

    fn is_config_error(err: DetectError) -> bool {
        matches!(err, DetectError::Engine(EngineError::Config(_)))
    }

    #[test]
    fn empty_output_table_is_rejected_at_construction() {
        let mut spec = ModelSpec::face_embedder();
        spec.outputs.clear();
        let engine = Arc::new(Canned {
            spec,
            outputs: Vec::new(),
        });
        let err = FaceEmbedder::new(engine).err().unwrap();
        assert!(is_config_error(err));

        let mut spec = ModelSpec::yolov8(640);
        spec.outputs.clear();
        let engine = Arc::new(Canned {
            spec,
            outputs: Vec::new(),
        });
        let err = ObjectDetector::new(engine, DetectParams::default()).err().unwrap();
        assert!(is_config_error(err));

        let mut spec = ModelSpec::face_dense();
        spec.outputs.clear();
        let engine = Arc::new(Canned {
            spec,
            outputs: Vec::new(),
        });
        let err = FaceDetector::new(engine, FaceParams::default()).err().unwrap();
        assert!(is_config_error(err));
    }

    #[test]
    fn truncated_head_table_is_rejected_at_construction() {
        let mut spec = ModelSpec::face_multi_head(640);
        spec.outputs.truncate(3);
        let engine = Arc::new(Canned {
            spec,
            outputs: Vec::new(),
        });
        let err = FaceDetector::new(engine, FaceParams::default()).err().unwrap();
        assert!(is_config_error(err));
    }

    #[test]
    fn face_detector_runs_nms() {
        let engine = dense_engine(&[
            [0.0, 0.0, 0.2, 0.2, 0.9],
            [0.01, 0.0, 0.2, 0.2, 0.8],
            [0.3, 0.3, 0.1, 0.1, 0.7],
        ]);
        let detector = FaceDetector::new(engine, FaceParams::default()).unwrap();
        let faces = detector.detect(&frame(320, 320)).unwrap();
        let scores: Vec<f32> = faces.iter().map(|f| f.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn processor_attaches_unit_embeddings() {
        let detector =
            FaceDetector::new(dense_engine(&[[0.0, 0.0, 0.2, 0.2, 0.9]]), FaceParams::default())
                .unwrap();
        let embedder = FaceEmbedder::new(embedder_engine()).unwrap();
        let processor = FaceProcessor::new(detector, Some(embedder));

        let faces = processor.process(&frame(640, 480)).unwrap();
        assert_eq!(faces.len(), 1);
        let emb = faces[0].embedding.as_ref().unwrap();
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn failed_embedding_skips_the_face() {
        let detector =
            FaceDetector::new(dense_engine(&[[0.0, 0.0, 0.2, 0.2, 0.9]]), FaceParams::default())
                .unwrap();
        let broken = Arc::new(Canned {
            spec: ModelSpec::face_embedder(),
            outputs: vec![Array2::<f32>::zeros((1, 64)).into_dyn()],
        });
        let processor = FaceProcessor::new(detector, Some(FaceEmbedder::new(broken).unwrap()));

        let faces = processor.process(&frame(320, 320)).unwrap();
        assert_eq!(faces.len(), 1);
        assert!(faces[0].embedding.is_none());
    }

    #[test]
    fn embedder_output_mismatch_is_shape_error() {
        let broken = Arc::new(Canned {
            spec: ModelSpec::face_embedder(),
            outputs: vec![Array2::<f32>::zeros((1, 64)).into_dyn()],
        });
        let embedder = FaceEmbedder::new(broken).unwrap();
        let err = embedder.embed_image(&frame(50, 80)).unwrap_err();
        assert!(matches!(
            err,
            DetectError::Engine(EngineError::TensorShapeMismatch { .. })
        ));
        assert_eq!(err.kind(), crate::ErrorKind::TensorShapeMismatch);
    }

    #[test]
    fn object_detector_bytes_reports_latency() {
        let mut out = Array3::<f32>::zeros((1, 84, 8400));
        out[[0, 0, 10]] = 320.0;
        out[[0, 1, 10]] = 320.0;
        out[[0, 2, 10]] = 50.0;
        out[[0, 3, 10]] = 80.0;
        out[[0, 4 + 17, 10]] = 0.75;
        let engine = Arc::new(Canned {
            spec: ModelSpec::yolov8(640),
            outputs: vec![out.into_dyn()],
        });
        let detector = ObjectDetector::new(engine, DetectParams::default()).unwrap();

        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(frame(64, 48))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let timed = detector.detect_bytes(&png).unwrap();
        assert!(timed.latency_ms >= 0.0);
        assert_eq!(timed.value.len(), 1);
        assert_eq!(timed.value[0].class, 17);
        assert_eq!(timed.value[0].bbox, [295.0, 280.0, 345.0, 360.0]);
    }
}
