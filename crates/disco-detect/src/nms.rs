//! Greedy non-maximum suppression.

use crate::{Detection, Face};

/// Anything with corner coordinates and a score.
pub trait Scored {
    fn corners(&self) -> [f32; 4];
    fn score(&self) -> f32;
}

impl Scored for Detection {
    fn corners(&self) -> [f32; 4] {
        self.bbox
    }

    fn score(&self) -> f32 {
        self.confidence
    }
}

impl Scored for Face {
    fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    fn score(&self) -> f32 {
        self.score
    }
}

/// Intersection over union of two corner boxes. 0 when the union is empty.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Keep the highest-scoring boxes, dropping any box whose IoU with an
/// already kept box reaches `iou_threshold`.
///
/// The sort is stable, so equal scores keep their input order.
pub fn suppress<B: Scored>(mut boxes: Vec<B>, iou_threshold: f32) -> Vec<B> {
    boxes.sort_by(|a, b| b.score().total_cmp(&a.score()));

    let mut keep: Vec<B> = Vec::with_capacity(boxes.len());
    'outer: for candidate in boxes {
        let corners = candidate.corners();
        for kept in &keep {
            if iou(&corners, &kept.corners()) >= iou_threshold {
                continue 'outer;
            }
        }
        keep.push(candidate);
    }
    keep
}
