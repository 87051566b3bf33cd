//! Resize + normalize an RGB frame into a planar `1×3×H×W` tensor.

use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{PreprocessError, Result};

/// How the source frame is fitted onto the model canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Resize {
    /// Per-axis nearest neighbour, aspect ratio is not kept.
    Stretch,
    /// Aspect-preserving fit, centred, the border filled with `fill`.
    /// `fill` is a [0,1] intensity and goes through the same
    /// normalization as real pixels.
    Letterbox { fill: f32 },
}

/// Value range of the encoded tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `byte / 255` → [0, 1]
    Unit,
    /// `byte / 255 * 2 - 1` → [-1, 1]
    Symmetric,
}

impl Normalization {
    /// Map a [0,1] intensity into this range.
    #[inline]
    pub fn apply(self, unit: f32) -> f32 {
        match self {
            Normalization::Unit => unit,
            Normalization::Symmetric => unit * 2.0 - 1.0,
        }
    }

    #[inline]
    fn byte(self, v: u8) -> f32 {
        self.apply(v as f32 / 255.0)
    }
}

/// Target canvas and policies for one model input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub width: u32,
    pub height: u32,
    pub resize: Resize,
    pub normalization: Normalization,
}

impl CodecConfig {
    /// Stretch resize with [0,1] values (plain object detector).
    pub fn stretch(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resize: Resize::Stretch,
            normalization: Normalization::Unit,
        }
    }

    /// Letterbox resize with [0,1] values and the given border intensity.
    pub fn letterbox(width: u32, height: u32, fill: f32) -> Self {
        Self {
            width,
            height,
            resize: Resize::Letterbox { fill },
            normalization: Normalization::Unit,
        }
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Number of f32 values in an encoded tensor.
    pub fn tensor_len(&self) -> usize {
        3 * self.width as usize * self.height as usize
    }
}

/// Geometry used to place the source frame on the model canvas.
///
/// Decoded boxes live in model-input pixels; callers that need source-image
/// coordinates map them back through [`Transform::to_source`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// `dst = src * scale` per axis.
    Stretch { scale_x: f32, scale_y: f32 },
    Letterbox {
        scale: f32,
        pad_x: u32,
        pad_y: u32,
        scaled_w: u32,
        scaled_h: u32,
    },
}

impl Transform {
    /// Map a model-input point back into the source frame.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        match *self {
            Transform::Stretch { scale_x, scale_y } => (x / scale_x, y / scale_y),
            Transform::Letterbox {
                scale, pad_x, pad_y, ..
            } => ((x - pad_x as f32) / scale, (y - pad_y as f32) / scale),
        }
    }
}

/// Encoded tensor plus the transform that produced it.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub tensor: Array4<f32>,
    pub transform: Transform,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: CodecConfig,
}

impl Preprocessor {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode `image` into a fresh `1×3×H×W` tensor.
    pub fn run(&self, image: &RgbImage) -> Result<Encoded> {
        let (src_w, src_h) = image.dimensions();
        if src_w == 0 || src_h == 0 {
            return Err(PreprocessError::InvalidImage(format!(
                "source image is {src_w}x{src_h}"
            )));
        }
        if self.config.width == 0 || self.config.height == 0 {
            return Err(PreprocessError::InvalidImage(format!(
                "target canvas is {}x{}",
                self.config.width, self.config.height
            )));
        }

        let encoded = match self.config.resize {
            Resize::Stretch => self.stretch(image),
            Resize::Letterbox { fill } => self.letterbox(image, fill),
        };
        trace!(src_w, src_h, transform = ?encoded.transform, "frame encoded");
        Ok(encoded)
    }

    fn stretch(&self, image: &RgbImage) -> Encoded {
        let (src_w, src_h) = image.dimensions();
        let (dst_w, dst_h) = (self.config.width, self.config.height);
        let norm = self.config.normalization;

        let cols = stretch_indices(src_w, dst_w);
        let rows = stretch_indices(src_h, dst_h);

        let tensor = Array4::from_shape_fn(
            (1, 3, dst_h as usize, dst_w as usize),
            |(_, c, y, x)| norm.byte(image.get_pixel(cols[x], rows[y])[c]),
        );

        Encoded {
            tensor,
            transform: Transform::Stretch {
                scale_x: dst_w as f32 / src_w as f32,
                scale_y: dst_h as f32 / src_h as f32,
            },
        }
    }

    fn letterbox(&self, image: &RgbImage, fill: f32) -> Encoded {
        let (src_w, src_h) = image.dimensions();
        let (dst_w, dst_h) = (self.config.width, self.config.height);
        let norm = self.config.normalization;

        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let scaled_w = ((src_w as f32 * scale) as u32).min(dst_w);
        let scaled_h = ((src_h as f32 * scale) as u32).min(dst_h);
        let pad_x = (dst_w - scaled_w) / 2;
        let pad_y = (dst_h - scaled_h) / 2;

        let cols = letterbox_indices(src_w, dst_w, pad_x, scaled_w, scale);
        let rows = letterbox_indices(src_h, dst_h, pad_y, scaled_h, scale);
        let fill = norm.apply(fill);

        let tensor = Array4::from_shape_fn(
            (1, 3, dst_h as usize, dst_w as usize),
            |(_, c, y, x)| match (cols[x], rows[y]) {
                (Some(sx), Some(sy)) => norm.byte(image.get_pixel(sx, sy)[c]),
                _ => fill,
            },
        );

        Encoded {
            tensor,
            transform: Transform::Letterbox {
                scale,
                pad_x,
                pad_y,
                scaled_w,
                scaled_h,
            },
        }
    }
}

/// Source index for every destination index: `dst * src_size / dst_size`.
pub(crate) fn stretch_indices(src_size: u32, dst_size: u32) -> Vec<u32> {
    (0..dst_size)
        .map(|d| (d as u64 * src_size as u64 / dst_size as u64) as u32)
        .collect()
}

/// Source index for every destination index, `None` inside the padding.
fn letterbox_indices(
    src_size: u32,
    dst_size: u32,
    pad: u32,
    scaled: u32,
    scale: f32,
) -> Vec<Option<u32>> {
    (0..dst_size)
        .map(|d| {
            let offset = d.checked_sub(pad).filter(|&o| o < scaled)?;
            Some(((offset as f32 / scale) as u32).min(src_size - 1))
        })
        .collect()
}
