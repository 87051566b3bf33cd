use image::{imageops, RgbImage};

use crate::{PreprocessError, Result};

/// Cut the `[x1, y1, x2, y2]` box out of `image`.
///
/// Corners are truncated to whole pixels and clamped to the frame; a box
/// that ends up with no width or height is an [`PreprocessError::InvalidCrop`].
pub fn crop_face(image: &RgbImage, bbox: [f32; 4]) -> Result<RgbImage> {
    let (w, h) = image.dimensions();

    let x1 = (bbox[0] as i64).max(0);
    let y1 = (bbox[1] as i64).max(0);
    let x2 = (bbox[2] as i64).min(w as i64);
    let y2 = (bbox[3] as i64).min(h as i64);

    let (crop_w, crop_h) = (x2 - x1, y2 - y1);
    if crop_w <= 0 || crop_h <= 0 {
        return Err(PreprocessError::InvalidCrop {
            width: crop_w,
            height: crop_h,
        });
    }

    Ok(imageops::crop_imm(image, x1 as u32, y1 as u32, crop_w as u32, crop_h as u32).to_image())
}
