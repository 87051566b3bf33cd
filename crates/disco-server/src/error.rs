use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use disco_detect::{DetectError, ErrorKind};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0} is not loaded")]
    NotLoaded(&'static str),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotLoaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Detect(e) => match e.kind() {
                ErrorKind::InvalidImage | ErrorKind::UnsupportedFormat | ErrorKind::InvalidCrop => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::InferenceFailure
                | ErrorKind::TensorShapeMismatch
                | ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
