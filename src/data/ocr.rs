//! Cropped text-line dataset for the recognition stage.

use std::path::{Path, PathBuf};

use image::RgbImage;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::annotations::{TextOcrAnnotations, ILLEGIBLE};
use super::transforms::{image_to_chw, Normalization};
use crate::boxes::BBox;
use crate::error::{DetectionError, Result};

pub const DEFAULT_CHARSET: &str =
    "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";

/// NFD-decomposes `text` and drops combining marks: "Café" -> "Cafe".
pub fn remove_accents(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

pub fn filter_text(text: &str, charset: &str) -> String {
    text.chars().filter(|c| charset.contains(*c)).collect()
}

/// Accent removal followed by the charset filter. `None` when nothing usable
/// remains.
pub fn normalize_text(text: &str, charset: &str) -> Option<String> {
    let cleaned = filter_text(&remove_accents(text), charset);
    if cleaned.is_empty() || cleaned == ILLEGIBLE {
        None
    } else {
        Some(cleaned)
    }
}

#[derive(Debug, Clone)]
pub struct OcrSample {
    /// Normalised `[3, H, W]` pixels, CHW.
    pub image: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
struct OcrEntry {
    annotation_id: String,
    text: String,
}

/// Line crops written by `crop-lines`, one `<annotation id>.png` per word.
#[derive(Debug, Clone)]
pub struct OcrLineDataset {
    entries: Vec<OcrEntry>,
    crops_dir: PathBuf,
    normalization: Normalization,
}

impl OcrLineDataset {
    pub fn new(
        annotations: &TextOcrAnnotations,
        crops_dir: impl Into<PathBuf>,
        charset: &str,
        normalization: Normalization,
    ) -> Self {
        let entries: Vec<OcrEntry> = annotations
            .image_ids()
            .into_iter()
            .flat_map(|id| annotations.annotations_for(id))
            .filter(|ann| ann.utf8_string != ILLEGIBLE)
            .filter_map(|ann| {
                normalize_text(&ann.utf8_string, charset).map(|text| OcrEntry {
                    annotation_id: ann.id.clone(),
                    text,
                })
            })
            .collect();

        let crops_dir = crops_dir.into();
        log::info!(
            "OcrLineDataset: {} text lines under {}",
            entries.len(),
            crops_dir.display()
        );

        Self {
            entries,
            crops_dir,
            normalization,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn text(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).map(|e| e.text.as_str())
    }

    pub fn crop_path(&self, idx: usize) -> Option<PathBuf> {
        self.entries
            .get(idx)
            .map(|e| crop_file(&self.crops_dir, &e.annotation_id))
    }

    /// Loads crop `idx`; a missing or unreadable crop yields `Ok(None)`.
    pub fn get(&self, idx: usize) -> Result<Option<OcrSample>> {
        let entry = self.entries.get(idx).ok_or_else(|| {
            DetectionError::shape("ocr index", format!("< {}", self.entries.len()), idx)
        })?;
        let path = crop_file(&self.crops_dir, &entry.annotation_id);

        let img = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Dropping text line {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        Ok(Some(OcrSample {
            image: image_to_chw(&img, &self.normalization),
            width: img.width(),
            height: img.height(),
            text: entry.text.clone(),
        }))
    }
}

fn crop_file(dir: &Path, annotation_id: &str) -> PathBuf {
    dir.join(format!("{}.png", annotation_id))
}

/// Cuts `bbox` out of `img`, clipped to the image. `None` when nothing is
/// left after clipping.
pub fn crop_line(img: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let x1 = bbox.x1.floor().max(0.0) as u32;
    let y1 = bbox.y1.floor().max(0.0) as u32;
    let x2 = (bbox.x2.ceil().max(0.0) as u32).min(img.width());
    let y2 = (bbox.y2.ceil().max(0.0) as u32).min(img.height());
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image::imageops::crop_imm(img, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// Writes one crop per legible annotation into `out_dir`; returns the number
/// written. Images that cannot be read are skipped.
pub fn export_crops(
    annotations: &TextOcrAnnotations,
    image_dir: &Path,
    out_dir: &Path,
    charset: &str,
) -> Result<usize> {
    std::fs::create_dir_all(out_dir).map_err(|e| DetectionError::io(out_dir, e))?;
    let mut written = 0;

    for image_id in annotations.image_ids() {
        let anns: Vec<_> = annotations
            .annotations_for(image_id)
            .into_iter()
            .filter(|a| normalize_text(&a.utf8_string, charset).is_some())
            .collect();
        if anns.is_empty() {
            continue;
        }
        let Some(path) = annotations.image_path(image_dir, image_id) else {
            continue;
        };
        let img = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        for ann in anns {
            let bbox = match ann.to_bbox() {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("Skipping annotation {}: {}", ann.id, e);
                    continue;
                }
            };
            if let Some(crop) = crop_line(&img, &bbox) {
                crop.save(crop_file(out_dir, &ann.id))?;
                written += 1;
            }
        }
    }

    log::info!("Wrote {} text-line crops to {}", written, out_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_remove_accents() {
        assert_eq!(remove_accents("Café Noël"), "Cafe Noel");
        assert_eq!(remove_accents("plain"), "plain");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("Ünïcödé!", DEFAULT_CHARSET).as_deref(), Some("Unicode!"));
        assert_eq!(normalize_text("日本", DEFAULT_CHARSET), None);
        assert_eq!(normalize_text(".", DEFAULT_CHARSET), None);
        assert_eq!(normalize_text(".é", "."), None);
    }

    #[test]
    fn test_crop_line_clips() {
        let img = RgbImage::from_pixel(10, 6, Rgb([1, 2, 3]));
        let crop = crop_line(&img, &BBox::new(-2.0, 1.2, 4.5, 20.0)).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        assert!(crop_line(&img, &BBox::new(12.0, 0.0, 15.0, 3.0)).is_none());
    }

    #[test]
    fn test_export_and_load() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(40, 20, Rgb([90, 90, 90]))
            .save(dir.path().join("a.png"))
            .unwrap();
        let json = r#"{
            "imgs": {"a": {"id": "a", "width": 40, "height": 20, "file_name": "a.png"}},
            "anns": {
                "a_1": {"id": "a_1", "image_id": "a", "bbox": [2, 2, 10, 6], "utf8_string": "Déjà"},
                "a_2": {"id": "a_2", "image_id": "a", "bbox": [20, 2, 10, 6], "utf8_string": "."},
                "a_3": {"id": "a_3", "image_id": "a", "bbox": [5, 10, 10, 6], "utf8_string": "ok"}
            },
            "imgToAnns": {"a": ["a_1", "a_2", "a_3"]}
        }"#;
        let ann: TextOcrAnnotations = serde_json::from_str(json).unwrap();
        let crops = dir.path().join("crops");

        assert_eq!(export_crops(&ann, dir.path(), &crops, DEFAULT_CHARSET).unwrap(), 2);

        let dataset = OcrLineDataset::new(&ann, &crops, DEFAULT_CHARSET, Normalization::default());
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.text(0), Some("Deja"));

        let sample = dataset.get(0).unwrap().unwrap();
        assert_eq!((sample.width, sample.height), (10, 6));
        assert_eq!(sample.image.len(), 3 * 10 * 6);

        std::fs::remove_file(dataset.crop_path(1).unwrap()).unwrap();
        assert!(dataset.get(1).unwrap().is_none());
    }
}
