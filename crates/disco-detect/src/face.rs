//! Face detector decode: the dense single-tensor layout and the
//! per-stride multi-head layout.

use disco_model::HeadBoxEncoding;
use ndarray::{ArrayD, ArrayView2, ArrayViewD};

use crate::{center_to_corners, squeeze_batch, ClampPolicy, DecodeError, Face};

/// Thresholds and canvas shared by both face decoders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceDecodeParams {
    pub conf_threshold: f32,
    /// Model canvas in pixels; boxes are clamped into it.
    pub frame_width: f32,
    pub frame_height: f32,
    /// A face must be strictly wider and taller than this after clamping.
    pub min_size: f32,
}

impl FaceDecodeParams {
    pub fn new(conf_threshold: f32, frame_width: u32, frame_height: u32) -> Self {
        Self {
            conf_threshold,
            frame_width: frame_width as f32,
            frame_height: frame_height as f32,
            min_size: 10.0,
        }
    }

    fn clamp(&self) -> ClampPolicy {
        ClampPolicy::Frame {
            width: self.frame_width,
            height: self.frame_height,
        }
    }

    /// Clamp, then apply the minimum-size filter.
    fn finish(&self, bbox: [f32; 4], score: f32) -> Option<Face> {
        let [x1, y1, x2, y2] = self.clamp().apply(bbox);
        (x2 - x1 > self.min_size && y2 - y1 > self.min_size)
            .then(|| Face::new([x1, y1, x2, y2], score))
    }
}

/// Map a normalized coordinate centred on 0 onto the canvas.
#[inline]
fn remap(coord: f32, frame: f32) -> f32 {
    (coord + 0.5) * frame
}

/// Decode `[1, N, row_len]` rows of `cx, cy, w, h, confidence, ..`.
pub fn decode_dense(
    output: ArrayViewD<'_, f32>,
    row_len: usize,
    params: &FaceDecodeParams,
) -> Result<Vec<Face>, DecodeError> {
    let expected = || format!("[1, candidates, {row_len}]");
    let rows = squeeze_batch(output, expected)?;
    if rows.ncols() != row_len || row_len < 5 {
        return Err(DecodeError::TensorShapeMismatch {
            expected: expected(),
            actual: rows.shape().to_vec(),
        });
    }

    let mut faces = Vec::new();
    for row in rows.rows() {
        let conf = row[4];
        if !conf.is_finite() || conf < params.conf_threshold {
            continue;
        }
        let [x1, y1, x2, y2] = center_to_corners(row[0], row[1], row[2], row[3]);
        let bbox = [
            remap(x1, params.frame_width),
            remap(y1, params.frame_height),
            remap(x2, params.frame_width),
            remap(y2, params.frame_height),
        ];
        faces.extend(params.finish(bbox, conf));
    }
    Ok(faces)
}

/// One stride group, shapes already checked.
struct Head<'a> {
    stride: u32,
    cols: usize,
    cls: ArrayView2<'a, f32>,
    obj: ArrayView2<'a, f32>,
    bbox: ArrayView2<'a, f32>,
}

fn head_view<'a>(
    tensor: &'a ArrayD<f32>,
    anchors: usize,
    width: usize,
) -> Result<ArrayView2<'a, f32>, DecodeError> {
    let expected = || format!("[1, {anchors}, {width}]");
    let view = squeeze_batch(tensor.view(), expected)?;
    if view.dim() != (anchors, width) {
        return Err(DecodeError::TensorShapeMismatch {
            expected: expected(),
            actual: view.shape().to_vec(),
        });
    }
    Ok(view)
}

/// Decode class / objectness / bbox heads, role-major:
/// `cls_s0..cls_sn, obj_s0..obj_sn, bbox_s0..bbox_sn`.
///
/// Anchor `a` of a stride sits at grid cell `(a % cols, a / cols)`. Its
/// score is `sqrt(cls * obj)` with both clamped to `[0, 1]`. Candidates of
/// all strides come back in stride order, not yet suppressed.
pub fn decode_multi_head(
    outputs: &[ArrayD<f32>],
    strides: &[u32],
    encoding: HeadBoxEncoding,
    params: &FaceDecodeParams,
) -> Result<Vec<Face>, DecodeError> {
    let n = strides.len();
    if outputs.len() != n * 3 {
        return Err(DecodeError::HeadCount {
            expected: n * 3,
            actual: outputs.len(),
        });
    }

    let mut heads = Vec::with_capacity(n);
    for (i, &stride) in strides.iter().enumerate() {
        let stride_px = stride.max(1) as f32;
        let cols = (params.frame_width / stride_px) as usize;
        let rows = (params.frame_height / stride_px) as usize;
        let anchors = cols * rows;
        heads.push(Head {
            stride,
            cols,
            cls: head_view(&outputs[i], anchors, 1)?,
            obj: head_view(&outputs[n + i], anchors, 1)?,
            bbox: head_view(&outputs[2 * n + i], anchors, 4)?,
        });
    }

    let mut faces = Vec::new();
    for head in &heads {
        let stride = head.stride as f32;
        for (a, b) in head.bbox.rows().into_iter().enumerate() {
            let cls = head.cls[[a, 0]].clamp(0.0, 1.0);
            let obj = head.obj[[a, 0]].clamp(0.0, 1.0);
            let score = (cls * obj).sqrt();
            if !score.is_finite() || score < params.conf_threshold {
                continue;
            }

            let (cx, cy, w, h) = match encoding {
                HeadBoxEncoding::Pixel => (b[0], b[1], b[2], b[3]),
                HeadBoxEncoding::Grid => {
                    let col = (a % head.cols) as f32;
                    let row = (a / head.cols) as f32;
                    (
                        (col + b[0]) * stride,
                        (row + b[1]) * stride,
                        b[2].exp() * stride,
                        b[3].exp() * stride,
                    )
                }
            };
            faces.extend(params.finish(center_to_corners(cx, cy, w, h), score));
        }
    }
    Ok(faces)
}
