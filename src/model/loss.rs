use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};

use crate::boxes::{best_anchor, encode_cell, AnchorSet, BBox};
use crate::clamp::ClampBoxCoords;
use crate::error::{DetectionError, Result};

/// Loss contract used by the training loop.
///
/// `predictions[s]` is the `[B, H, W, A, 5 + C]` head output of scale `s`,
/// `targets[s]` the zero-padded `[B, N, 4]` corner boxes (canvas pixels)
/// assigned to that scale, and `anchors.group(s)` its anchors.
pub trait DetectionLoss<B: Backend> {
    fn loss(
        &self,
        predictions: &[Tensor<B, 5>],
        targets: &[Tensor<B, 3>],
        anchors: &AnchorSet,
        canvas: usize,
    ) -> Result<Tensor<B, 1>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub object: f32,
    pub no_object: f32,
    pub xy: f32,
    pub wh: f32,
    pub giou: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            object: 1.0,
            no_object: 1.0,
            xy: 1.0,
            wh: 1.0,
            giou: 1.0,
        }
    }
}

/// Objectness BCE + masked coordinate regression + GIoU, summed over scales.
#[derive(Debug, Clone, Default)]
pub struct YoloLoss {
    pub weights: LossWeights,
}

/// Dense per-cell targets of one scale, built on the host.
struct ScaleTargets {
    dims: [usize; 4],
    mask: Vec<f32>,
    xy: [Vec<f32>; 2],
    wh: [Vec<f32>; 2],
    corners: [Vec<f32>; 4],
    assigned: usize,
}

impl YoloLoss {
    pub fn new(weights: LossWeights) -> Self {
        Self { weights }
    }

    fn build_targets(
        targets: &[f32],
        target_dims: [usize; 3],
        pred_dims: [usize; 5],
        group: &[[f32; 2]],
        canvas: usize,
    ) -> ScaleTargets {
        let [batch, grid, _, num_anchors, _] = pred_dims;
        let cell_size = canvas as f32 / grid as f32;
        let cells = batch * grid * grid * num_anchors;

        let mut t = ScaleTargets {
            dims: [batch, grid, grid, num_anchors],
            mask: vec![0.0; cells],
            xy: [vec![0.0; cells], vec![0.0; cells]],
            wh: [vec![0.0; cells], vec![0.0; cells]],
            corners: [vec![0.0; cells], vec![0.0; cells], vec![0.0; cells], vec![0.0; cells]],
            assigned: 0,
        };

        let boxes_per_image = target_dims[1];
        for (b, image_boxes) in targets.chunks_exact(4 * boxes_per_image.max(1)).enumerate() {
            if b >= batch || boxes_per_image == 0 {
                break;
            }
            for raw in image_boxes.chunks_exact(4) {
                let bbox = BBox::new(raw[0], raw[1], raw[2], raw[3]);
                if bbox.is_zero() || !bbox.is_valid() {
                    continue;
                }
                let center = bbox.to_center();

                let (anchor, _) = best_anchor(group, center.w, center.h);
                let (row, col, enc) = encode_cell(&center, group[anchor], cell_size, grid);

                let idx = ((b * grid + row) * grid + col) * num_anchors + anchor;
                if t.mask[idx] == 0.0 {
                    t.assigned += 1;
                }
                t.mask[idx] = 1.0;
                t.xy[0][idx] = enc[0];
                t.xy[1][idx] = enc[1];
                t.wh[0][idx] = enc[2];
                t.wh[1][idx] = enc[3];
                for (k, v) in bbox.to_array().into_iter().enumerate() {
                    t.corners[k][idx] = v;
                }
            }
        }
        t
    }

    fn scale_loss<B: Backend>(
        &self,
        pred: &Tensor<B, 5>,
        targets: &ScaleTargets,
        group: &[[f32; 2]],
        canvas: usize,
    ) -> Tensor<B, 1> {
        let device = pred.device();
        let dims = targets.dims;
        let [batch, grid, _, num_anchors] = dims;
        let cell_size = canvas as f32 / grid as f32;
        let host = |v: &[f32]| Tensor::<B, 4>::from_data(TensorData::new(v.to_vec(), dims), &device);
        let channel = |k: usize| {
            pred.clone()
                .slice([0..batch, 0..grid, 0..grid, 0..num_anchors, k..k + 1])
                .reshape(dims)
        };

        let mask = host(&targets.mask);
        let inverse_mask = mask.clone().neg().add_scalar(1.0);
        let positives = targets.assigned.max(1) as f32;
        let w = &self.weights;

        // objectness, averaged over every cell/anchor
        let logits = channel(4);
        let bce = bce_with_logits(logits, mask.clone());
        let obj_weight = mask.clone().mul_scalar(w.object) + inverse_mask.mul_scalar(w.no_object);
        let obj_loss = (bce * obj_weight).mean();

        // coordinate regression on assigned cells only
        let px = sigmoid(channel(0));
        let py = sigmoid(channel(1));
        let tw = channel(2);
        let th = channel(3);

        let xy_err = (px.clone() - host(&targets.xy[0])).powf_scalar(2.0)
            + (py.clone() - host(&targets.xy[1])).powf_scalar(2.0);
        let wh_err = (tw.clone() - host(&targets.wh[0])).powf_scalar(2.0)
            + (th.clone() - host(&targets.wh[1])).powf_scalar(2.0);
        let xy_loss = (xy_err * mask.clone()).sum().div_scalar(positives);
        let wh_loss = (wh_err * mask.clone()).sum().div_scalar(positives);

        // GIoU between decoded, canvas-clamped predictions and their targets
        let (grid_x, grid_y, anchor_w, anchor_h) = grid_tensors::<B>(dims, group, &device);
        let cx = (grid_x + px).mul_scalar(cell_size);
        let cy = (grid_y + py).mul_scalar(cell_size);
        let pw = anchor_w * tw.clamp(-10.0, 10.0).exp();
        let ph = anchor_h * th.clamp(-10.0, 10.0).exp();

        let clamp = ClampBoxCoords::canvas(canvas as f32);
        let x1 = clamp.forward(cx.clone() - pw.clone().div_scalar(2.0));
        let y1 = clamp.forward(cy.clone() - ph.clone().div_scalar(2.0));
        let x2 = clamp.forward(cx + pw.div_scalar(2.0));
        let y2 = clamp.forward(cy + ph.div_scalar(2.0));
        let giou = generalized_iou(
            [x1, y1, x2, y2],
            [
                host(&targets.corners[0]),
                host(&targets.corners[1]),
                host(&targets.corners[2]),
                host(&targets.corners[3]),
            ],
        );
        let giou_loss = (giou.neg().add_scalar(1.0) * mask).sum().div_scalar(positives);

        obj_loss
            + xy_loss.mul_scalar(w.xy)
            + wh_loss.mul_scalar(w.wh)
            + giou_loss.mul_scalar(w.giou)
    }
}

impl<B: Backend> DetectionLoss<B> for YoloLoss {
    fn loss(
        &self,
        predictions: &[Tensor<B, 5>],
        targets: &[Tensor<B, 3>],
        anchors: &AnchorSet,
        canvas: usize,
    ) -> Result<Tensor<B, 1>> {
        if predictions.len() != targets.len() {
            return Err(DetectionError::shape(
                "loss scales",
                format!("{} target groups", predictions.len()),
                targets.len(),
            ));
        }
        if predictions.is_empty() {
            return Err(DetectionError::shape("loss scales", "at least one scale", 0));
        }
        anchors.check_scales(predictions.len())?;

        let mut total: Option<Tensor<B, 1>> = None;
        for (scale, (pred, target)) in predictions.iter().zip(targets).enumerate() {
            let group = anchors.group(scale)?;
            let pred_dims = pred.dims();
            check_prediction_dims(pred_dims, group.len())?;

            let target_dims = target.dims();
            if target_dims[0] != pred_dims[0] || target_dims[2] != 4 {
                return Err(DetectionError::shape(
                    "loss targets",
                    format!("[{}, N, 4]", pred_dims[0]),
                    format!("{:?}", target_dims),
                ));
            }

            let values = target
                .clone()
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| DetectionError::TensorData(format!("{:?}", e)))?;
            let scale_targets = Self::build_targets(&values, target_dims, pred_dims, group, canvas);
            log::debug!(
                "loss scale {}: grid {} assigned {}",
                scale,
                pred_dims[1],
                scale_targets.assigned
            );

            let scale_loss = self.scale_loss(pred, &scale_targets, group, canvas);
            total = Some(match total {
                Some(t) => t + scale_loss,
                None => scale_loss,
            });
        }

        total
            .map(|t| t.reshape([1]))
            .ok_or_else(|| DetectionError::shape("loss scales", "at least one scale", 0))
    }
}

/// Head outputs must be square grids whose anchor axis matches the group
/// size; the decode step relies on both.
pub fn check_prediction_dims(dims: [usize; 5], group_size: usize) -> Result<()> {
    let [_, grid_h, grid_w, num_anchors, entry] = dims;
    if grid_h != grid_w {
        return Err(DetectionError::shape(
            "prediction grid",
            "square grid",
            format!("{}x{}", grid_h, grid_w),
        ));
    }
    if num_anchors != group_size {
        return Err(DetectionError::shape("anchors per scale", group_size, num_anchors));
    }
    if entry < 5 {
        return Err(DetectionError::shape("prediction entry", ">= 5 values", entry));
    }
    Ok(())
}

/// Numerically stable `BCE(sigmoid(x), t)`.
fn bce_with_logits<B: Backend>(logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 4> {
    let softplus = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    logits.clone().clamp_min(0.0) - logits * targets + softplus
}

fn grid_tensors<B: Backend>(
    dims: [usize; 4],
    group: &[[f32; 2]],
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, grid, _, num_anchors] = dims;
    let cells = batch * grid * grid * num_anchors;
    let mut gx = Vec::with_capacity(cells);
    let mut gy = Vec::with_capacity(cells);
    let mut aw = Vec::with_capacity(cells);
    let mut ah = Vec::with_capacity(cells);
    for _ in 0..batch {
        for row in 0..grid {
            for col in 0..grid {
                for anchor in group.iter().take(num_anchors) {
                    gx.push(col as f32);
                    gy.push(row as f32);
                    aw.push(anchor[0]);
                    ah.push(anchor[1]);
                }
            }
        }
    }
    let make = |v: Vec<f32>| Tensor::<B, 4>::from_data(TensorData::new(v, dims), device);
    (make(gx), make(gy), make(aw), make(ah))
}

fn generalized_iou<B: Backend>(pred: [Tensor<B, 4>; 4], target: [Tensor<B, 4>; 4]) -> Tensor<B, 4> {
    let [px1, py1, px2, py2] = pred;
    let [tx1, ty1, tx2, ty2] = target;

    let inter_w = (px2.clone().min_pair(tx2.clone()) - px1.clone().max_pair(tx1.clone())).clamp_min(0.0);
    let inter_h = (py2.clone().min_pair(ty2.clone()) - py1.clone().max_pair(ty1.clone())).clamp_min(0.0);
    let inter = inter_w * inter_h;

    let pred_area = (px2.clone() - px1.clone()).clamp_min(0.0) * (py2.clone() - py1.clone()).clamp_min(0.0);
    let target_area = (tx2.clone() - tx1.clone()) * (ty2.clone() - ty1.clone());
    let union = pred_area + target_area - inter.clone();

    let hull_w = px2.max_pair(tx2) - px1.min_pair(tx1);
    let hull_h = py2.max_pair(ty2) - py1.min_pair(ty1);
    let hull = (hull_w * hull_h).add_scalar(1e-6);

    let iou = inter / union.clone().add_scalar(1e-6);
    iou - (hull.clone() - union).div(hull)
}
