//! Single-tensor object detector decode (YOLOv8 layout).

use ndarray::ArrayViewD;

use crate::{center_to_corners, squeeze_batch, ClampPolicy, DecodeError, Detection};

/// Decode a `[1, 4 + num_classes, anchors]` (or unbatched) tensor.
///
/// Rows `0..4` hold `cx, cy, w, h`; rows `4..` hold class scores. Each
/// anchor keeps its best class, the first one on ties. Anchors below
/// `conf_threshold` are dropped.
pub fn decode_detections(
    output: ArrayViewD<'_, f32>,
    num_classes: usize,
    conf_threshold: f32,
    clamp: ClampPolicy,
) -> Result<Vec<Detection>, DecodeError> {
    let rows = 4 + num_classes;
    let view = squeeze_batch(output, || format!("[1, {rows}, anchors]"))?;
    if view.nrows() != rows || num_classes == 0 {
        return Err(DecodeError::TensorShapeMismatch {
            expected: format!("[1, {rows}, anchors]"),
            actual: view.shape().to_vec(),
        });
    }

    let mut detections = Vec::new();
    for anchor in view.columns() {
        let mut class = 0;
        let mut best = anchor[4];
        for c in 1..num_classes {
            let score = anchor[4 + c];
            if score > best {
                best = score;
                class = c;
            }
        }
        if !best.is_finite() || best < conf_threshold {
            continue;
        }

        let bbox = center_to_corners(anchor[0], anchor[1], anchor[2], anchor[3]);
        detections.push(Detection {
            class,
            confidence: best,
            bbox: clamp.apply(bbox),
        });
    }
    Ok(detections)
}
