//! HTTP handlers. Every request decodes its own image and runs its pipeline
//! on the blocking pool; nothing but the loaded models is shared.

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use disco_detect::{Detection, Face};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::AppState;

/// Snapshot of the most recent face request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMetrics {
    pub image_name: String,
    pub num_faces: usize,
    pub latency_ms: f64,
    pub faces: Vec<Face>,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub detections: Vec<Detection>,
    pub latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct FacesResponse {
    pub faces: Vec<Face>,
    pub latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub latency_ms: f64,
}

struct Upload {
    name: String,
    bytes: Vec<u8>,
}

/// Oversized bodies surface as a multipart error carrying 413.
fn upload_error(context: &str, e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(format!("upload too large: {}", e.body_text()))
    } else {
        ApiError::BadRequest(format!("{context}: {e}"))
    }
}

/// Pull the `image` field out of a multipart form.
async fn read_image(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error("multipart error", e))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| upload_error("failed to read image", e))?;
        return Ok(Upload {
            name,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::BadRequest("no image provided".into()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> disco_detect::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Worker(e.to_string()))?
        .map_err(ApiError::from)
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /detect
pub async fn detect(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let detector = state
        .detector
        .clone()
        .ok_or(ApiError::NotLoaded("object detector"))?;
    let upload = read_image(multipart).await?;
    info!(image = %upload.name, size = upload.bytes.len(), "detect");

    let timed = run_blocking(move || detector.detect_bytes(&upload.bytes)).await?;
    info!(
        detections = timed.value.len(),
        latency_ms = timed.latency_ms,
        "detect complete"
    );
    Ok(Json(DetectResponse {
        detections: timed.value,
        latency_ms: timed.latency_ms,
    }))
}

/// POST /face/process
pub async fn face_process(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<FacesResponse>, ApiError> {
    let processor = state
        .faces
        .clone()
        .ok_or(ApiError::NotLoaded("face detector"))?;
    let upload = read_image(multipart).await?;
    info!(image = %upload.name, size = upload.bytes.len(), "face process");

    let Upload { name, bytes } = upload;
    let timed = run_blocking(move || processor.process_bytes(&bytes)).await?;

    *state.last_face_metrics.write().await = Some(FaceMetrics {
        image_name: name,
        num_faces: timed.value.len(),
        latency_ms: timed.latency_ms,
        faces: timed.value.clone(),
        kind: "face_process".into(),
    });

    info!(
        faces = timed.value.len(),
        latency_ms = timed.latency_ms,
        "face process complete"
    );
    Ok(Json(FacesResponse {
        faces: timed.value,
        latency_ms: timed.latency_ms,
    }))
}

/// POST /face/embed. The whole upload is treated as one face crop.
pub async fn face_embed(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let embedder = state
        .embedder
        .clone()
        .ok_or(ApiError::NotLoaded("face embedder"))?;
    let upload = read_image(multipart).await?;
    info!(image = %upload.name, "face embed");

    let Upload { name, bytes } = upload;
    let timed = run_blocking(move || embedder.embed_bytes(&bytes)).await?;

    let mut face = Face::new([0.0; 4], 0.0);
    face.embedding = Some(timed.value.clone());
    *state.last_face_metrics.write().await = Some(FaceMetrics {
        image_name: name,
        num_faces: 1,
        latency_ms: timed.latency_ms,
        faces: vec![face],
        kind: "face_embed".into(),
    });

    info!(latency_ms = timed.latency_ms, "face embed complete");
    Ok(Json(EmbeddingResponse {
        embedding: timed.value,
        latency_ms: timed.latency_ms,
    }))
}

/// GET /face/metrics
pub async fn face_metrics(State(state): State<AppState>) -> Response {
    match state.last_face_metrics.read().await.clone() {
        Some(metrics) => Json(metrics).into_response(),
        None => Json(json!({ "metrics": null })).into_response(),
    }
}
