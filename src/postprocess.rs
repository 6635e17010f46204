//! Decode -> confidence filter -> sequential NMS passes -> clamp -> un-letterbox.
//!
//! Shared by the training-time visualisation and the inference binary so both
//! see exactly the same boxes.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boxes::{decode_cell, AnchorSet, BBox, CellPrediction, Letterbox};
use crate::clamp::ClampBoxCoords;
use crate::error::{DetectionError, Result};
use crate::model::loss::check_prediction_dims;
use crate::model::nms::{nms_passes, Detection};

/// Decodes every cell/anchor of every scale into canvas-space corner boxes,
/// one list per image, scales concatenated finest first.
///
/// `outputs[s]` is paired with `anchors.group(s)`. A group count that differs
/// from the number of outputs, or a group whose size differs from the
/// tensor's anchor axis, is an error.
pub fn decode_predictions<B: Backend>(
    outputs: &[Tensor<B, 5>],
    anchors: &AnchorSet,
    canvas: usize,
) -> Result<Vec<Vec<Detection>>> {
    anchors.check_scales(outputs.len())?;
    let batch = outputs.first().map(|t| t.dims()[0]).unwrap_or(0);
    let mut per_image = vec![Vec::new(); batch];

    for (scale, output) in outputs.iter().enumerate() {
        let group = anchors.group(scale)?;
        let dims = output.dims();
        check_prediction_dims(dims, group.len())?;
        let [b, grid, _, num_anchors, entry] = dims;
        if b != batch {
            return Err(DetectionError::shape("scale batch size", batch, b));
        }

        let values = output
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| DetectionError::TensorData(format!("{:?}", e)))?;
        let cell_size = canvas as f32 / grid as f32;

        for (chunk_idx, chunk) in values.chunks_exact(entry).enumerate() {
            let anchor = chunk_idx % num_anchors;
            let cell = chunk_idx / num_anchors;
            let col = cell % grid;
            let row = (cell / grid) % grid;
            let image = cell / (grid * grid);

            let pred = CellPrediction::from_slice(chunk)?;
            let (center, confidence) = decode_cell(&pred, row, col, group[anchor], cell_size);
            per_image[image].push(Detection::new(center.to_corners(), confidence));
        }
    }

    Ok(per_image)
}

/// Keeps detections with `confidence >= threshold`, preserving order.
pub fn filter_confidences(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

/// Maps canvas-space boxes back to the original image and clips them to its
/// bounds.
pub fn unletterbox(detections: &[Detection], letterbox: &Letterbox) -> Vec<Detection> {
    let clamp_x = ClampBoxCoords::new(0.0, letterbox.orig_width as f32);
    let clamp_y = ClampBoxCoords::new(0.0, letterbox.orig_height as f32);
    detections
        .iter()
        .map(|d| {
            let b = letterbox.invert(&d.bbox);
            let bbox = BBox::new(
                clamp_x.clamp_value(b.x1),
                clamp_y.clamp_value(b.y1),
                clamp_x.clamp_value(b.x2),
                clamp_y.clamp_value(b.y2),
            );
            Detection::new(bbox, d.confidence)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageDetections {
    /// Boxes on the padded square canvas.
    pub canvas: Vec<Detection>,
    /// The same boxes in original image pixels.
    pub original: Vec<Detection>,
}

impl ImageDetections {
    pub fn is_empty(&self) -> bool {
        self.canvas.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessor {
    pub conf_threshold: f32,
    /// Applied in order as independent NMS passes.
    pub nms_thresholds: Vec<f32>,
    pub canvas: usize,
}

impl PostProcessor {
    pub fn new(conf_threshold: f32, nms_thresholds: Vec<f32>, canvas: usize) -> Self {
        Self {
            conf_threshold,
            nms_thresholds,
            canvas,
        }
    }

    /// Filter, suppress and clamp the decoded boxes of one image.
    pub fn select(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let clamp = ClampBoxCoords::canvas(self.canvas as f32);
        let kept = filter_confidences(detections, self.conf_threshold);
        nms_passes(kept, &self.nms_thresholds)
            .into_iter()
            .map(|d| {
                let [x1, y1, x2, y2] = d.bbox.to_array().map(|v| clamp.clamp_value(v));
                Detection::new(BBox::new(x1, y1, x2, y2), d.confidence)
            })
            .collect()
    }

    /// Full pipeline for a batch. `letterboxes[i]` describes how image `i`
    /// was placed on the canvas.
    pub fn process<B: Backend>(
        &self,
        outputs: &[Tensor<B, 5>],
        anchors: &AnchorSet,
        letterboxes: &[Letterbox],
    ) -> Result<Vec<ImageDetections>> {
        let decoded = decode_predictions(outputs, anchors, self.canvas)?;
        if decoded.len() != letterboxes.len() {
            return Err(DetectionError::shape(
                "letterbox records",
                decoded.len(),
                letterboxes.len(),
            ));
        }

        let results: Vec<ImageDetections> = decoded
            .into_iter()
            .zip(letterboxes)
            .map(|(dets, letterbox)| {
                let canvas = self.select(dets);
                let original = unletterbox(&canvas, letterbox);
                ImageDetections { canvas, original }
            })
            .collect();

        log::debug!(
            "post-processed {} image(s), {} box(es)",
            results.len(),
            results.iter().map(|r| r.canvas.len()).sum::<usize>()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn det(x1: f32, confidence: f32) -> Detection {
        Detection::new(BBox::new(x1, 0.0, x1 + 5.0, 5.0), confidence)
    }

    #[test]
    fn test_filter_confidences_keeps_order() {
        let dets = vec![det(0.0, 0.2), det(1.0, 0.5), det(2.0, 0.9), det(3.0, 0.49), det(4.0, 0.7)];
        let kept = filter_confidences(dets.clone(), 0.5);
        let expected: Vec<Detection> = dets.into_iter().filter(|d| d.confidence >= 0.5).collect();
        assert_eq!(kept, expected);
        assert_eq!(kept.iter().map(|d| d.bbox.x1).collect::<Vec<_>>(), vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_unletterbox_inverts_placement() {
        let letterbox = Letterbox::with_padding(200, 100, 64, 0, 7).unwrap();
        let original = BBox::new(20.0, 10.0, 120.0, 60.0);
        let on_canvas = Detection::new(letterbox.apply(&original), 0.8);
        let back = unletterbox(&[on_canvas], &letterbox)[0].bbox;
        for (a, b) in back.to_array().iter().zip(original.to_array()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_select_clamps_to_canvas() {
        let post = PostProcessor::new(0.5, vec![0.7, 0.3], 32);
        let out = post.select(vec![Detection::new(BBox::new(-4.0, 2.0, 40.0, 30.0), 0.9)]);
        assert_eq!(out[0].bbox, BBox::new(0.0, 2.0, 32.0, 30.0));
    }

    #[test]
    fn test_decode_rejects_group_size_mismatch() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 5>::zeros([1, 4, 4, 2, 5], &device);
        let anchors = AnchorSet::new(vec![[8.0, 8.0], [4.0, 4.0], [2.0, 2.0]], 3).unwrap();
        assert!(decode_predictions(&[output], &anchors, 32).is_err());
    }

    #[test]
    fn test_decode_rejects_extra_anchor_groups() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 5>::zeros([1, 4, 4, 1, 5], &device);
        let anchors = AnchorSet::new(vec![[2.0, 2.0], [8.0, 8.0], [32.0, 32.0]], 1).unwrap();
        assert!(matches!(
            decode_predictions(&[output.clone()], &anchors, 32),
            Err(DetectionError::ShapeMismatch { .. })
        ));

        let post = PostProcessor::new(0.5, vec![0.7, 0.3], 32);
        let letterbox = Letterbox::centered(32, 32, 32).unwrap();
        assert!(post.process(&[output.clone()], &anchors, &[letterbox]).is_err());

        let single = AnchorSet::new(vec![[8.0, 8.0]], 1).unwrap();
        let decoded = decode_predictions(&[output], &single, 32).unwrap();
        assert_eq!(decoded[0].len(), 16);
        // zero logits: center of cell (0, 0) with the 8px anchor
        assert_eq!(decoded[0][0].bbox, BBox::new(0.0, 0.0, 8.0, 8.0));
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 5>::full([1, 4, 4, 1, 5], -8.0, &device);
        let anchors = AnchorSet::new(vec![[8.0, 8.0]], 1).unwrap();
        let post = PostProcessor::new(0.5, vec![0.5], 32);
        let results = post
            .process(&[output], &anchors, &[Letterbox::centered(32, 32, 32).unwrap()])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_empty());
    }

    #[test]
    fn test_single_confident_cell_end_to_end() {
        // 4x4 grid over a 32px canvas, one 10x10 anchor per cell
        let device = Default::default();
        let gt = BBox::new(8.0, 8.0, 20.0, 18.0); // center (14, 13) in cell (1, 1)

        let logit = |p: f32| (p / (1.0 - p)).ln();
        let mut values = vec![0.0f32; 4 * 4 * 5];
        for cell in 0..16 {
            values[cell * 5 + 4] = -6.0;
        }
        let hit = (4 + 1) * 5;
        values[hit] = logit(0.75);
        values[hit + 1] = logit(0.63);
        values[hit + 2] = (12.2f32 / 10.0).ln();
        values[hit + 3] = 0.0;
        values[hit + 4] = 6.0;

        let output = Tensor::<TestBackend, 5>::from_data(TensorData::new(values, [1, 4, 4, 1, 5]), &device);
        let anchors = AnchorSet::new(vec![[10.0, 10.0]], 1).unwrap();
        let post = PostProcessor::new(0.5, vec![0.5], 32);

        let results = post
            .process(&[output], &anchors, &[Letterbox::centered(32, 32, 32).unwrap()])
            .unwrap();
        assert_eq!(results[0].canvas.len(), 1);
        assert!(results[0].canvas[0].bbox.iou(&gt) > 0.9);
        assert!(results[0].original[0].bbox.iou(&gt) > 0.9);
    }
}
