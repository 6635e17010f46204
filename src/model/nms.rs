use serde::{Deserialize, Serialize};

use crate::boxes::BBox;

/// A decoded box in corner form with its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}

/// Greedy class-agnostic non-maximum suppression.
///
/// Boxes are visited by descending confidence; each kept box suppresses every
/// remaining box whose IoU with it is strictly greater than `iou_threshold`.
/// The result is sorted by descending confidence, so a second pass with the
/// same threshold returns it unchanged.
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections;
    if sorted.is_empty() {
        return sorted;
    }

    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; sorted.len()];
    let mut kept = Vec::new();

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        let current = sorted[i];
        kept.push(current);

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if current.bbox.iou(&sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    kept
}

/// Sequential independent NMS passes, one per threshold.
pub fn nms_passes(detections: Vec<Detection>, thresholds: &[f32]) -> Vec<Detection> {
    thresholds
        .iter()
        .fold(detections, |dets, &threshold| nms(dets, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), confidence)
    }

    #[test]
    fn test_overlapping_pair_keeps_higher_confidence() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.6);
        let b = det(1.0, 1.0, 11.0, 11.0, 0.9);
        assert!(a.bbox.iou(&b.bbox) > 0.5);

        let kept = nms(vec![a, b], 0.5);
        assert_eq!(kept, vec![b]);
    }

    #[test]
    fn test_disjoint_pair_both_survive() {
        let a = det(0.0, 0.0, 10.0, 10.0, 0.6);
        let b = det(5.0, 0.0, 15.0, 10.0, 0.9);
        // IoU = 50 / 150
        assert!(a.bbox.iou(&b.bbox) < 0.5);

        let kept = nms(vec![a, b], 0.5);
        assert_eq!(kept, vec![b, a]);
    }

    #[test]
    fn test_idempotent() {
        let boxes = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9),
            det(1.0, 0.0, 11.0, 10.0, 0.8),
            det(20.0, 20.0, 30.0, 30.0, 0.7),
            det(22.0, 21.0, 31.0, 29.0, 0.95),
            det(50.0, 50.0, 60.0, 52.0, 0.3),
            det(5.0, 0.0, 15.0, 10.0, 0.7),
        ];
        for threshold in [0.1, 0.3, 0.5, 0.7] {
            let once = nms(boxes.clone(), threshold);
            let twice = nms(once.clone(), threshold);
            assert_eq!(once, twice, "threshold {}", threshold);
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        // IoU exactly 0.5 stays below a 0.5 threshold
        let a = det(0.0, 0.0, 30.0, 10.0, 0.9);
        let b = det(10.0, 0.0, 40.0, 10.0, 0.8);
        assert!((a.bbox.iou(&b.bbox) - 0.5).abs() < 1e-6);
        assert_eq!(nms(vec![a, b], 0.5).len(), 2);
    }

    #[test]
    fn test_passes_run_in_order() {
        // IoU ~0.43: survives the 0.7 pass, removed by the 0.3 pass
        let a = det(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = det(4.0, 0.0, 14.0, 10.0, 0.8);
        let dets = vec![a, b];

        assert_eq!(nms_passes(dets.clone(), &[0.7]).len(), 2);
        assert_eq!(nms_passes(dets, &[0.7, 0.3]), vec![a]);
    }

    #[test]
    fn test_empty() {
        assert!(nms(Vec::new(), 0.5).is_empty());
    }
}
