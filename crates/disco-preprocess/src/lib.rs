// disco-preprocess/src/lib.rs
// ============================================================
// disco-preprocess  –  image → planar tensor stage
// Decodes request bytes to RGB and packs them into the fixed
// 1×3×H×W f32 layout each model expects.
// ------------------------------------------------------------
// Public API
//   * decode_image(bytes)          – bytes → RgbImage
//   * Preprocessor::run(image)     – RgbImage → Encoded { tensor, transform }
//   * crop_face(image, bbox)       – clamp + cut a face box out of the frame
// ------------------------------------------------------------
// Resize policy (stretch vs letterbox) and value range ([0,1] vs
// [-1,1]) are chosen per model through `CodecConfig`; they are
// not interchangeable, the decoders assume the policy the model
// was exported with.
// ============================================================

//! disco – preprocessing layer
//!
//! Everything between "bytes arrived over HTTP" and "tensor handed to the
//! engine". The output is always a freshly allocated [`ndarray::Array4`]
//! in planar RGB order, so the flat view reads `[C][H][W]`.

use image::{ImageError, RgbImage};
use thiserror::Error;

mod codec;
mod crop;

pub use codec::{CodecConfig, Encoded, Normalization, Preprocessor, Resize, Transform};
pub use crop::crop_face;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid crop size: {width}x{height}")]
    InvalidCrop { width: i64, height: i64 },
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

/// Decode an encoded image (PNG / JPEG / GIF) into an 8-bit RGB buffer.
/// Animated GIFs yield their first frame.
///
/// Containers the decoder does not handle map to
/// [`PreprocessError::UnsupportedFormat`]; truncated or corrupt data and
/// zero-sized images map to [`PreprocessError::InvalidImage`].
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(PreprocessError::InvalidImage("empty buffer".into()));
    }

    // Unrecognised magic bytes are corrupt input; a recognised container
    // without a compiled-in decoder is an unsupported format.
    let format = image::guess_format(bytes)
        .map_err(|e| PreprocessError::InvalidImage(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(bytes, format).map_err(|e| match e {
        ImageError::Unsupported(u) => PreprocessError::UnsupportedFormat(u.to_string()),
        other => PreprocessError::InvalidImage(other.to_string()),
    })?;

    let rgb = decoded.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(PreprocessError::InvalidImage(format!(
            "image is {}x{}",
            rgb.width(),
            rgb.height()
        )));
    }
    Ok(rgb)
}
