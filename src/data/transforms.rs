use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::boxes::{BBox, Letterbox};
use crate::error::{DetectionError, Result};

/// Per-channel normalisation `(x / 255 - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.3490, 0.3219, 0.2957],
            std: [0.2993, 0.2850, 0.2735],
        }
    }
}

impl Normalization {
    #[inline]
    pub fn normalize(&self, channel: usize, value: u8) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }

    #[inline]
    pub fn denormalize(&self, channel: usize, value: f32) -> u8 {
        let v = (value * self.std[channel] + self.mean[channel]).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    }
}

/// Resizes `img` as described by `letterbox`, normalises it and writes it
/// into a zero-filled `[3, S, S]` canvas (CHW). Zero is the normalised mean,
/// so padding carries no signal.
pub fn letterbox_to_chw(img: &RgbImage, letterbox: &Letterbox, norm: &Normalization) -> Vec<f32> {
    let size = letterbox.target as usize;
    let plane = size * size;
    let mut chw = vec![0.0f32; plane * 3];

    let resized = image::imageops::resize(
        img,
        letterbox.resized_width,
        letterbox.resized_height,
        FilterType::Triangle,
    );

    let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let idx = (y as usize + pad_y) * size + x as usize + pad_x;
        for c in 0..3 {
            chw[c * plane + idx] = norm.normalize(c, pixel[c]);
        }
    }
    chw
}

/// Plain CHW normalisation without letterboxing.
pub fn image_to_chw(img: &RgbImage, norm: &Normalization) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (idx, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            chw[c * plane + idx] = norm.normalize(c, pixel[c]);
        }
    }
    chw
}

/// Inverse of [`image_to_chw`], used to render the network input.
pub fn chw_to_image(chw: &[f32], width: u32, height: u32, norm: &Normalization) -> Result<RgbImage> {
    let plane = (width * height) as usize;
    if chw.len() != plane * 3 {
        return Err(DetectionError::shape("chw buffer", plane * 3, chw.len()));
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        Rgb([
            norm.denormalize(0, chw[idx]),
            norm.denormalize(1, chw[plane + idx]),
            norm.denormalize(2, chw[2 * plane + idx]),
        ])
    }))
}

/// Random rotation about the image centre, applied with probability `p`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomRotation {
    pub max_degrees: f32,
    pub p: f64,
}

impl Default for RandomRotation {
    fn default() -> Self {
        Self {
            max_degrees: 10.0,
            p: 0.5,
        }
    }
}

impl RandomRotation {
    /// Angle in degrees; 0 when the rotation is not applied.
    pub fn sample_angle<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        if self.max_degrees <= 0.0 || !rng.gen_bool(self.p.clamp(0.0, 1.0)) {
            return 0.0;
        }
        rng.gen_range(-self.max_degrees..=self.max_degrees)
    }

    /// Rotates clockwise (image coordinates, y down) by `degrees`; uncovered
    /// corners are black.
    pub fn rotate_image(img: &RgbImage, degrees: f32) -> RgbImage {
        if degrees == 0.0 {
            return img.clone();
        }
        rotate_about_center(img, degrees.to_radians(), Interpolation::Bilinear, Rgb([0, 0, 0]))
    }

    /// Rotates the four corners of `bbox` about the centre of a
    /// `width x height` image the same way [`RandomRotation::rotate_image`]
    /// does and returns their axis-aligned hull.
    pub fn rotate_bbox(width: u32, height: u32, bbox: &BBox, degrees: f32) -> BBox {
        if degrees == 0.0 {
            return *bbox;
        }
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let (sin, cos) = degrees.to_radians().sin_cos();

        let corners = [
            (bbox.x1, bbox.y1),
            (bbox.x2, bbox.y1),
            (bbox.x1, bbox.y2),
            (bbox.x2, bbox.y2),
        ];
        let mut hull = BBox::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for (x, y) in corners {
            let (dx, dy) = (x - cx, y - cy);
            let rx = dx * cos - dy * sin + cx;
            let ry = dx * sin + dy * cos + cy;
            hull.x1 = hull.x1.min(rx);
            hull.y1 = hull.y1.min(ry);
            hull.x2 = hull.x2.max(rx);
            hull.y2 = hull.y2.max(ry);
        }
        hull
    }
}

/// Running per-channel statistics over a set of images. Each image
/// contributes its own mean and mean of squares with equal weight.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    sum: [f64; 3],
    sum_sq: [f64; 3],
    images: usize,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, img: &RgbImage) {
        let pixels = (img.width() as f64 * img.height() as f64).max(1.0);
        let mut sum = [0.0f64; 3];
        let mut sum_sq = [0.0f64; 3];
        for pixel in img.pixels() {
            for c in 0..3 {
                let v = pixel[c] as f64 / 255.0;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }
        for c in 0..3 {
            self.sum[c] += sum[c] / pixels;
            self.sum_sq[c] += sum_sq[c] / pixels;
        }
        self.images += 1;
    }

    pub fn images(&self) -> usize {
        self.images
    }

    pub fn finish(&self) -> Result<Normalization> {
        if self.images == 0 {
            return Err(DetectionError::EmptyEpoch("channel statistics"));
        }
        let n = self.images as f64;
        let mut norm = Normalization {
            mean: [0.0; 3],
            std: [0.0; 3],
        };
        for c in 0..3 {
            let mean = self.sum[c] / n;
            let var = (self.sum_sq[c] / n - mean * mean).max(0.0);
            norm.mean[c] = mean as f32;
            norm.std[c] = var.sqrt() as f32;
        }
        Ok(norm)
    }
}

/// Image files (`jpg`, `jpeg`, `png`) under `dir`, recursively, sorted.
pub fn find_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        })
        .collect();
    images.sort();
    images
}

/// Mean/std of every readable image under `dir`. Unreadable files are
/// skipped with a warning.
pub fn directory_stats(dir: &Path) -> Result<Normalization> {
    let mut stats = ChannelStats::new();
    for path in find_images(dir) {
        match image::open(&path) {
            Ok(img) => stats.update(&img.to_rgb8()),
            Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
        }
    }
    log::info!("Channel statistics over {} image(s)", stats.images());
    stats.finish()
}
