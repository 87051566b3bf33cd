// disco-server/src/lib.rs
// ============================================================
// disco-server  –  HTTP front end
// Loads the configured models once, then serves
//   POST /detect          → {"detections", "latency_ms"}
//   POST /face/process    → {"faces", "latency_ms"}
//   POST /face/embed      → {"embedding", "latency_ms"}
//   GET  /face/metrics    → last face request snapshot
//   GET  /health          → {"status": "ok"}
// ------------------------------------------------------------
// Each model sits behind a Deadline worker; a stuck call answers 504,
// calls queued behind it answer 503.
// ============================================================

//! disco – server layer

pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use disco_detect::{FaceDetector, FaceEmbedder, FaceProcessor, ObjectDetector};
use disco_model::{Deadline, InferenceEngine, ModelSpec, OrtEngine};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::{Cli, FaceDetectorKind, ServerConfig};
pub use error::ApiError;
pub use handlers::FaceMetrics;

/// Shared across handlers. Models are optional; a missing one answers 503.
#[derive(Clone)]
pub struct AppState {
    pub detector: Option<Arc<ObjectDetector>>,
    pub faces: Option<Arc<FaceProcessor>>,
    pub embedder: Option<Arc<FaceEmbedder>>,
    pub last_face_metrics: Arc<RwLock<Option<FaceMetrics>>>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        detector: Option<ObjectDetector>,
        faces: Option<FaceProcessor>,
        embedder: Option<FaceEmbedder>,
    ) -> Self {
        Self {
            detector: detector.map(Arc::new),
            faces: faces.map(Arc::new),
            embedder: embedder.map(Arc::new),
            last_face_metrics: Arc::new(RwLock::new(None)),
            max_upload_bytes: ServerConfig::default().max_upload_bytes,
        }
    }

    /// Load every model the config names. The object detector is required,
    /// the face models are only loaded when their paths are set.
    pub fn load(config: &ServerConfig) -> Result<Self> {
        let detector = ObjectDetector::new(
            load_engine(&config.model_path, config.object_spec()?, config)?,
            config.detect,
        )?;

        let embedder = match &config.face_embedder_path {
            Some(path) => Some(FaceEmbedder::new(load_engine(
                path,
                config.face_embedder_spec()?,
                config,
            )?)?),
            None => None,
        };

        let faces = match &config.face_detector_path {
            Some(path) => {
                let detector = FaceDetector::new(
                    load_engine(path, config.face_detector_spec()?, config)?,
                    config.face,
                )?;
                if embedder.is_none() {
                    warn!("no face embedder configured; /face/process returns boxes only");
                }
                Some(FaceProcessor::new(detector, embedder.clone()))
            }
            None => None,
        };

        let mut state = Self::new(Some(detector), faces, embedder);
        state.max_upload_bytes = config.max_upload_bytes;
        Ok(state)
    }
}

fn load_engine(
    path: &std::path::Path,
    spec: ModelSpec,
    config: &ServerConfig,
) -> Result<Arc<dyn InferenceEngine>> {
    let engine = OrtEngine::load(path, spec, config.intra_threads)
        .with_context(|| format!("loading model {}", path.display()))?;
    let engine = Deadline::new(Arc::new(engine), config.deadline())
        .with_context(|| format!("starting inference worker for {}", path.display()))?;
    Ok(Arc::new(engine))
}

pub fn build_router(state: AppState) -> Router {
    let limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(handlers::health))
        .route("/detect", post(handlers::detect))
        .route("/face/process", post(handlers::face_process))
        .route("/face/embed", post(handlers::face_embed))
        .route("/face/metrics", get(handlers::face_metrics))
        .layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr = config.addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "server listening");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
