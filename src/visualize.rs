//! Box overlays for the training-time snapshots and the inference binary.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::boxes::BBox;
use crate::error::{DetectionError, Result};
use crate::model::Detection;

pub const PREDICTION_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
pub const GROUND_TRUTH_COLOR: Rgb<u8> = Rgb([32, 220, 32]);

/// Draws `bbox` as a two-pixel outline clipped to the image. Boxes that end
/// up empty after clipping are skipped.
pub fn draw_box(image: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    let clipped = BBox::new(
        bbox.x1.clamp(0.0, image.width() as f32),
        bbox.y1.clamp(0.0, image.height() as f32),
        bbox.x2.clamp(0.0, image.width() as f32),
        bbox.y2.clamp(0.0, image.height() as f32),
    );
    let x = clipped.x1.round() as i32;
    let y = clipped.y1.round() as i32;
    let width = (clipped.x2.round() as i32 - x).max(0) as u32;
    let height = (clipped.y2.round() as i32 - y).max(0) as u32;
    if width == 0 || height == 0 {
        return;
    }

    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);
    if width > 2 && height > 2 {
        draw_hollow_rect_mut(image, Rect::at(x + 1, y + 1).of_size(width - 2, height - 2), color);
    }
}

/// Copy of `image` with ground truth (green) under predictions (red).
/// Padding rows in `ground_truth` are ignored.
pub fn render_detections(image: &RgbImage, detections: &[Detection], ground_truth: &[BBox]) -> RgbImage {
    let mut canvas = image.clone();
    for gt in ground_truth.iter().filter(|b| !b.is_zero()) {
        draw_box(&mut canvas, gt, GROUND_TRUTH_COLOR);
    }
    for det in detections {
        draw_box(&mut canvas, &det.bbox, PREDICTION_COLOR);
    }
    canvas
}

pub fn visualization_path(dir: &Path, epoch: usize, batch: usize, sample: usize) -> PathBuf {
    dir.join(format!("epoch{:03}_batch{:05}_sample{}.png", epoch, batch, sample))
}

pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DetectionError::io(parent, e))?;
    }
    image.save(path)?;
    Ok(())
}
