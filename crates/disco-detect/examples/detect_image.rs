// examples/detect_image.rs
//------------------------------------------------------------
// One-shot detector run:  image file → preprocess → ORT → print
//   cargo run -p disco-detect --example detect_image -- <image> [model.onnx]
//------------------------------------------------------------
use std::sync::Arc;

use anyhow::{Context, Result};
use disco_detect::{DetectParams, Detector, ObjectDetector};
use disco_model::{ModelSpec, OrtEngine};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let image_path = args.next().context("usage: detect_image <image> [model.onnx]")?;
    let model_path = args
        .next()
        .or_else(|| std::env::var("MODEL_PATH").ok())
        .unwrap_or_else(|| "models/yolov8n.onnx".into());

    //---------------- engine --------------------------------
    let engine = OrtEngine::load(&model_path, ModelSpec::yolov8(640), num_cpus::get())
        .with_context(|| format!("loading {model_path}"))?;
    let params = DetectParams {
        iou_threshold: Some(0.45),
        ..DetectParams::default()
    };
    let detector = ObjectDetector::new(Arc::new(engine), params)?;

    //---------------- run -----------------------------------
    let bytes = std::fs::read(&image_path).with_context(|| format!("reading {image_path}"))?;
    let frame = disco_preprocess::decode_image(&bytes)?;

    let start = std::time::Instant::now();
    let detections = detector.detect(&frame)?;
    let elapsed = start.elapsed();

    println!(
        "{} detections in {:.1} ms ({}x{})",
        detections.len(),
        elapsed.as_secs_f64() * 1000.0,
        frame.width(),
        frame.height()
    );
    for d in &detections {
        println!(
            "class={:>2} conf={:.3} box=[{:.1}, {:.1}, {:.1}, {:.1}]",
            d.class, d.confidence, d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]
        );
    }
    Ok(())
}
