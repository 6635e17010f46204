//! Box parametrizations and the conversions between them.
//!
//! Three spaces are involved:
//! - grid-relative YOLO offsets `(tx, ty, tw, th)` produced by a detection head,
//! - center/size and corner boxes in pixels of the padded square canvas,
//! - corner boxes in pixels of the original (un-letterboxed) image.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DetectionError, Result};

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Axis-aligned box in corner form `[x1, y1, x2, y2]`.
///
/// The all-zero box is the padding placeholder used by batch collation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_array(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Padding rows are exactly zero in every coordinate.
    pub fn is_zero(&self) -> bool {
        self.x1 == 0.0 && self.y1 == 0.0 && self.x2 == 0.0 && self.y2 == 0.0
    }

    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn to_center(self) -> CenterBox {
        CenterBox {
            cx: (self.x1 + self.x2) * 0.5,
            cy: (self.y1 + self.y2) * 0.5,
            w: self.x2 - self.x1,
            h: self.y2 - self.y1,
        }
    }

    pub fn clamp_to(self, min: f32, max: f32) -> Self {
        Self {
            x1: self.x1.clamp(min, max),
            y1: self.y1.clamp(min, max),
            x2: self.x2.clamp(min, max),
            y2: self.y2.clamp(min, max),
        }
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let x1_inter = self.x1.max(other.x1);
        let y1_inter = self.y1.max(other.y1);
        let x2_inter = self.x2.min(other.x2);
        let y2_inter = self.y2.min(other.y2);

        if x2_inter < x1_inter || y2_inter < y1_inter {
            return 0.0;
        }

        let intersection = (x2_inter - x1_inter) * (y2_inter - y1_inter);
        let union = self.area() + other.area() - intersection;

        intersection / union.max(1e-6)
    }
}

/// Box in center/size form. IoU is only defined after [`CenterBox::to_corners`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl CenterBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    pub fn to_corners(self) -> BBox {
        to_corners(self.cx, self.cy, self.w, self.h)
    }
}

pub fn to_corners(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    BBox {
        x1: cx - w / 2.0,
        y1: cy - h / 2.0,
        x2: cx + w / 2.0,
        y2: cy + h / 2.0,
    }
}

/// Raw head output for one anchor of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellPrediction {
    pub tx: f32,
    pub ty: f32,
    pub tw: f32,
    pub th: f32,
    pub confidence_logit: f32,
}

impl CellPrediction {
    pub fn from_slice(v: &[f32]) -> Result<Self> {
        if v.len() < 5 {
            return Err(DetectionError::shape("cell prediction", ">= 5 values", v.len()));
        }
        Ok(Self {
            tx: v[0],
            ty: v[1],
            tw: v[2],
            th: v[3],
            confidence_logit: v[4],
        })
    }
}

/// YOLO anchor transform. `cell_size` is the pixel size of one grid cell of the
/// scale that `anchor_wh` belongs to; mixing anchors and grids across scales
/// yields meaningless boxes.
pub fn decode_cell(
    pred: &CellPrediction,
    row: usize,
    col: usize,
    anchor_wh: [f32; 2],
    cell_size: f32,
) -> (CenterBox, f32) {
    let cx = (col as f32 + sigmoid(pred.tx)) * cell_size;
    let cy = (row as f32 + sigmoid(pred.ty)) * cell_size;
    let w = anchor_wh[0] * pred.tw.exp();
    let h = anchor_wh[1] * pred.th.exp();

    (CenterBox::new(cx, cy, w, h), sigmoid(pred.confidence_logit))
}

/// Inverse of [`decode_cell`] for the box part: returns the owning cell and
/// the `(tx_offset, ty_offset, tw, th)` regression targets, where the offsets
/// are already in sigmoid space (`0..1` inside the cell).
pub fn encode_cell(
    center: &CenterBox,
    anchor_wh: [f32; 2],
    cell_size: f32,
    grid: usize,
) -> (usize, usize, [f32; 4]) {
    let gx = center.cx / cell_size;
    let gy = center.cy / cell_size;
    let col = (gx.floor().max(0.0) as usize).min(grid.saturating_sub(1));
    let row = (gy.floor().max(0.0) as usize).min(grid.saturating_sub(1));

    let targets = [
        gx - col as f32,
        gy - row as f32,
        (center.w / anchor_wh[0]).max(1e-6).ln(),
        (center.h / anchor_wh[1]).max(1e-6).ln(),
    ];

    (row, col, targets)
}

/// Reduces a flattened `x, y, x, y, ...` polygon to its axis-aligned hull.
pub fn polygon_to_bbox(points: &[f32]) -> Result<BBox> {
    if points.len() % 2 != 0 {
        return Err(DetectionError::shape(
            "polygon",
            "an even number of coordinates",
            points.len(),
        ));
    }
    let n = points.len() / 2;
    if n < 2 {
        return Err(DetectionError::DegeneratePolygon(n));
    }

    let mut bbox = BBox::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
    for p in points.chunks_exact(2) {
        bbox.x1 = bbox.x1.min(p[0]);
        bbox.y1 = bbox.y1.min(p[1]);
        bbox.x2 = bbox.x2.max(p[0]);
        bbox.y2 = bbox.y2.max(p[1]);
    }
    Ok(bbox)
}

/// Aspect-preserving resize onto a square canvas plus padding.
///
/// Forward: `x' = x * scale_x + pad_x`. Inverse: `x = (x' - pad_x) / scale_x`.
/// Per-axis scales are kept because resized dimensions are rounded to whole
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Letterbox {
    pub target: u32,
    pub orig_width: u32,
    pub orig_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Size the original image so its longer side equals `target`.
    pub fn resized_dims(orig_width: u32, orig_height: u32, target: u32) -> Result<(u32, u32)> {
        if target == 0 {
            return Err(DetectionError::InvalidConfig(
                "letterbox canvas must be at least one pixel".to_string(),
            ));
        }
        let longer = orig_width.max(orig_height).max(1) as f32;
        let scale = target as f32 / longer;
        let w = ((orig_width as f32 * scale).round() as u32).clamp(1, target);
        let h = ((orig_height as f32 * scale).round() as u32).clamp(1, target);
        Ok((w, h))
    }

    pub fn with_padding(orig_width: u32, orig_height: u32, target: u32, pad_x: u32, pad_y: u32) -> Result<Self> {
        let (resized_width, resized_height) = Self::resized_dims(orig_width, orig_height, target)?;
        Ok(Self {
            target,
            orig_width,
            orig_height,
            resized_width,
            resized_height,
            scale_x: resized_width as f32 / orig_width.max(1) as f32,
            scale_y: resized_height as f32 / orig_height.max(1) as f32,
            pad_x: pad_x.min(target - resized_width),
            pad_y: pad_y.min(target - resized_height),
        })
    }

    pub fn centered(orig_width: u32, orig_height: u32, target: u32) -> Result<Self> {
        let (w, h) = Self::resized_dims(orig_width, orig_height, target)?;
        Self::with_padding(orig_width, orig_height, target, (target - w) / 2, (target - h) / 2)
    }

    /// Left/top offsets drawn uniformly from the available slack.
    pub fn random<R: Rng + ?Sized>(orig_width: u32, orig_height: u32, target: u32, rng: &mut R) -> Result<Self> {
        let (w, h) = Self::resized_dims(orig_width, orig_height, target)?;
        let pad_x = rng.gen_range(0..=target - w);
        let pad_y = rng.gen_range(0..=target - h);
        Self::with_padding(orig_width, orig_height, target, pad_x, pad_y)
    }

    pub fn apply(&self, b: &BBox) -> BBox {
        BBox {
            x1: b.x1 * self.scale_x + self.pad_x as f32,
            y1: b.y1 * self.scale_y + self.pad_y as f32,
            x2: b.x2 * self.scale_x + self.pad_x as f32,
            y2: b.y2 * self.scale_y + self.pad_y as f32,
        }
    }

    pub fn invert(&self, b: &BBox) -> BBox {
        BBox {
            x1: (b.x1 - self.pad_x as f32) / self.scale_x,
            y1: (b.y1 - self.pad_y as f32) / self.scale_y,
            x2: (b.x2 - self.pad_x as f32) / self.scale_x,
            y2: (b.y2 - self.pad_y as f32) / self.scale_y,
        }
    }
}

/// Width/height IoU of two boxes sharing a center.
pub fn wh_iou(a: [f32; 2], b: [f32; 2]) -> f32 {
    let inter = a[0].min(b[0]) * a[1].min(b[1]);
    let union = a[0] * a[1] + b[0] * b[1] - inter;
    inter / union.max(1e-6)
}

/// Anchor templates in canvas pixels, grouped per detection scale.
/// Group `i` belongs to head output `i` (finest grid first).
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    anchors: Vec<[f32; 2]>,
    per_scale: usize,
}

impl AnchorSet {
    pub fn new(anchors: Vec<[f32; 2]>, per_scale: usize) -> Result<Self> {
        if per_scale == 0 {
            return Err(DetectionError::InvalidAnchors(
                "anchors per scale must be positive".to_string(),
            ));
        }
        if anchors.is_empty() || anchors.len() % per_scale != 0 {
            return Err(DetectionError::InvalidAnchors(format!(
                "{} anchors cannot be split into groups of {}",
                anchors.len(),
                per_scale
            )));
        }
        if let Some(bad) = anchors
            .iter()
            .find(|a| !(a[0].is_finite() && a[1].is_finite() && a[0] > 0.0 && a[1] > 0.0))
        {
            return Err(DetectionError::InvalidAnchors(format!(
                "anchor {:?} must have positive finite width and height",
                bad
            )));
        }
        Ok(Self { anchors, per_scale })
    }

    /// Reads a JSON array of `[width, height]` pairs.
    pub fn from_json(path: impl AsRef<Path>, per_scale: usize) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DetectionError::io(path, e))?;
        let anchors: Vec<[f32; 2]> =
            serde_json::from_str(&content).map_err(|e| DetectionError::json(path, e))?;
        log::info!("Loaded {} anchors from {}", anchors.len(), path.display());
        Self::new(anchors, per_scale)
    }

    pub fn per_scale(&self) -> usize {
        self.per_scale
    }

    pub fn num_scales(&self) -> usize {
        self.anchors.len() / self.per_scale
    }

    pub fn all(&self) -> &[[f32; 2]] {
        &self.anchors
    }

    pub fn group(&self, scale: usize) -> Result<&[[f32; 2]]> {
        if scale >= self.num_scales() {
            return Err(DetectionError::shape(
                "anchor group",
                format!("scale < {}", self.num_scales()),
                scale,
            ));
        }
        Ok(&self.anchors[scale * self.per_scale..(scale + 1) * self.per_scale])
    }

    /// Errors unless there is exactly one group per head output.
    pub fn check_scales(&self, outputs: usize) -> Result<()> {
        if self.num_scales() != outputs {
            return Err(DetectionError::shape(
                "anchor groups",
                format!("{} (one per head output)", outputs),
                self.num_scales(),
            ));
        }
        Ok(())
    }

    /// Best-matching anchor over all groups as `(scale, index_in_group, iou)`.
    /// Ties go to the finer scale.
    pub fn best_match(&self, w: f32, h: f32) -> (usize, usize, f32) {
        let mut best = (0, 0, f32::MIN);
        for (scale, group) in self.anchors.chunks_exact(self.per_scale).enumerate() {
            let (idx, iou) = best_anchor(group, w, h);
            if iou > best.2 {
                best = (scale, idx, iou);
            }
        }
        best
    }
}

/// Index and width/height IoU of the best anchor in `group`; first wins on ties.
pub fn best_anchor(group: &[[f32; 2]], w: f32, h: f32) -> (usize, f32) {
    group
        .iter()
        .enumerate()
        .map(|(i, a)| (i, wh_iou([w, h], *a)))
        .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best })
}
