use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::boxes::{polygon_to_bbox, BBox};
use crate::error::{DetectionError, Result};

/// Marker TextOCR uses for illegible words.
pub const ILLEGIBLE: &str = ".";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub file_name: String,
    #[serde(default)]
    pub set: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub image_id: String,
    /// `[x, y, width, height]`
    pub bbox: Vec<f32>,
    /// Flattened polygon `x, y, x, y, ...`.
    #[serde(default)]
    pub points: Vec<f32>,
    pub utf8_string: String,
}

impl Annotation {
    /// Axis-aligned box in original image pixels. The polygon is preferred;
    /// the `bbox` field is the fallback when no points are present.
    pub fn to_bbox(&self) -> Result<BBox> {
        if !self.points.is_empty() {
            return polygon_to_bbox(&self.points);
        }
        match self.bbox.as_slice() {
            [x, y, w, h] => Ok(BBox::new(*x, *y, x + w, y + h)),
            other => Err(DetectionError::shape("annotation bbox", 4, other.len())),
        }
    }
}

/// TextOCR-style annotation file: `imgs`, `anns` and the `imgToAnns` index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextOcrAnnotations {
    pub imgs: HashMap<String, ImageInfo>,
    #[serde(default)]
    pub anns: HashMap<String, Annotation>,
    #[serde(default, rename = "imgToAnns")]
    pub img_to_anns: HashMap<String, Vec<String>>,
}

impl TextOcrAnnotations {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DetectionError::io(path, e))?;
        let annotations: Self =
            serde_json::from_str(&content).map_err(|e| DetectionError::json(path, e))?;
        log::info!(
            "Loaded {} images / {} annotations from {}",
            annotations.imgs.len(),
            annotations.anns.len(),
            path.display()
        );
        Ok(annotations)
    }

    /// Image ids in a stable order.
    pub fn image_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.imgs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Annotations of one image in index order; dangling ids are skipped.
    pub fn annotations_for(&self, image_id: &str) -> Vec<&Annotation> {
        self.img_to_anns
            .get(image_id)
            .map(|ids| ids.iter().filter_map(|id| self.anns.get(id)).collect())
            .unwrap_or_default()
    }

    /// Resolves an image file under `image_dir`, accepting both the stored
    /// relative path and its bare file name.
    pub fn image_path(&self, image_dir: &Path, image_id: &str) -> Option<PathBuf> {
        let info = self.imgs.get(image_id)?;
        let full = image_dir.join(&info.file_name);
        if full.exists() {
            return Some(full);
        }
        Path::new(&info.file_name)
            .file_name()
            .map(|name| image_dir.join(name))
    }
}
