use std::sync::Arc;
use std::thread;
use std::time::Duration;

use disco_detect::{
    iou, suppress, DetectError, Detector, ErrorKind, FaceDetector, FaceEmbedder, FaceParams,
    FaceProcessor,
};
use disco_model::{Deadline, InferenceEngine, ModelSpec};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayD};

/// Multi-head engine that returns one face per call at a fixed cell.
struct OneFace {
    spec: ModelSpec,
    delay: Duration,
}

impl OneFace {
    fn new() -> Self {
        Self {
            spec: ModelSpec::face_multi_head(640),
            delay: Duration::ZERO,
        }
    }
}

impl InferenceEngine for OneFace {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn run(&self, _input: Array4<f32>) -> disco_model::Result<Vec<ArrayD<f32>>> {
        thread::sleep(self.delay);
        let mut out: Vec<ArrayD<f32>> = self
            .spec
            .outputs
            .iter()
            .map(|o| ArrayD::zeros(o.shape.clone()))
            .collect();
        // stride 32 head: cls, obj, bbox
        out[2][[0, 0, 0]] = 0.9;
        out[5][[0, 0, 0]] = 0.9;
        for (i, v) in [200.0, 200.0, 100.0, 120.0].into_iter().enumerate() {
            out[8][[0, 0, i]] = v;
        }
        // a second, overlapping candidate on stride 16
        out[1][[0, 0, 0]] = 0.7;
        out[4][[0, 0, 0]] = 0.7;
        for (i, v) in [204.0, 202.0, 100.0, 120.0].into_iter().enumerate() {
            out[7][[0, 0, i]] = v;
        }
        Ok(out)
    }
}

struct Embedder;

impl InferenceEngine for Embedder {
    fn spec(&self) -> &ModelSpec {
        static SPEC: std::sync::OnceLock<ModelSpec> = std::sync::OnceLock::new();
        SPEC.get_or_init(ModelSpec::face_embedder)
    }

    fn run(&self, input: Array4<f32>) -> disco_model::Result<Vec<ArrayD<f32>>> {
        // a crude descriptor: mean of each channel, padded with ones
        let mut v = vec![1.0f32; 128];
        for c in 0..3 {
            v[c] = input.index_axis(ndarray::Axis(1), c).mean().unwrap_or(0.0);
        }
        Ok(vec![ndarray::Array2::from_shape_vec((1, 128), v)
            .map_err(|e| disco_model::EngineError::Inference(e.to_string()))?
            .into_dyn()])
    }
}

fn frame() -> RgbImage {
    RgbImage::from_fn(800, 600, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
}

#[test]
fn multi_head_pipeline_end_to_end() {
    let detector = FaceDetector::new(Arc::new(OneFace::new()), FaceParams::default()).unwrap();
    let faces = detector.detect(&frame()).unwrap();

    assert_eq!(faces.len(), 1, "overlapping candidate must be suppressed");
    let f = &faces[0];
    assert!((f.score - 0.9).abs() < 1e-6);
    assert_eq!([f.x1, f.y1, f.x2, f.y2], [150.0, 140.0, 250.0, 260.0]);
}

#[test]
fn processor_embeds_every_face() {
    let detector = FaceDetector::new(Arc::new(OneFace::new()), FaceParams::default()).unwrap();
    let embedder = FaceEmbedder::new(Arc::new(Embedder)).unwrap();
    let processor = FaceProcessor::new(detector, Some(embedder));

    let faces = processor.process(&frame()).unwrap();
    let emb = faces[0].embedding.as_ref().unwrap();
    assert_eq!(emb.len(), 128);
    let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[test]
fn detector_without_embedder_returns_bare_faces() {
    let detector = FaceDetector::new(Arc::new(OneFace::new()), FaceParams::default()).unwrap();
    let faces = FaceProcessor::new(detector, None).process(&frame()).unwrap();
    assert_eq!(faces.len(), 1);
    assert!(faces[0].embedding.is_none());
}

#[test]
fn deadline_surfaces_as_timeout_kind() {
    let slow = OneFace {
        delay: Duration::from_millis(500),
        ..OneFace::new()
    };
    let engine = Arc::new(Deadline::new(Arc::new(slow), Duration::from_millis(20)).unwrap());
    let detector = FaceDetector::new(engine, FaceParams::default()).unwrap();

    let err = detector.detect(&frame()).unwrap_err();
    assert!(matches!(err, DetectError::Engine(_)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn garbage_bytes_are_invalid_image() {
    let embedder = FaceEmbedder::new(Arc::new(Embedder)).unwrap();
    let err = embedder.embed_bytes(b"definitely not an image").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);
}

#[test]
fn concurrent_calls_do_not_interfere() {
    let detector =
        Arc::new(FaceDetector::new(Arc::new(OneFace::new()), FaceParams::default()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let detector = Arc::clone(&detector);
            thread::spawn(move || detector.detect(&frame()).unwrap())
        })
        .collect();

    for h in handles {
        let faces = h.join().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].x1, 150.0);
    }
}

#[test]
fn nms_properties_on_random_boxes() {
    // deterministic pseudo-random boxes
    let mut seed = 7u32;
    let mut next = || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (seed >> 16) as f32 / 65_536.0
    };
    let boxes: Vec<_> = (0..200)
        .map(|_| {
            let (x, y) = (next() * 500.0, next() * 500.0);
            let (w, h) = (10.0 + next() * 80.0, 10.0 + next() * 80.0);
            disco_detect::Face::new([x, y, x + w, y + h], next())
        })
        .collect();

    let kept = suppress(boxes.clone(), 0.4);
    assert!(kept.iter().all(|k| boxes.contains(k)));
    assert!(kept.windows(2).all(|w| w[0].score >= w[1].score));
    for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
            let ia = [a.x1, a.y1, a.x2, a.y2];
            let ib = [b.x1, b.y1, b.x2, b.y2];
            assert!(iou(&ia, &ib) < 0.4);
        }
    }
}

#[test]
fn dense_tensor_through_public_decoder() {
    let mut t = Array3::<f32>::zeros((1, 2, 14));
    t[[0, 0, 2]] = 0.25;
    t[[0, 0, 3]] = 0.25;
    t[[0, 0, 4]] = 0.99;
    let params = disco_detect::FaceDecodeParams::new(0.6, 320, 320);
    let faces = disco_detect::decode_dense(t.view().into_dyn(), 14, &params).unwrap();
    assert_eq!(faces.len(), 1);
    assert_eq!([faces[0].x1, faces[0].x2], [120.0, 200.0]);
}
