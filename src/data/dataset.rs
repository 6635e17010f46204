use std::path::{Path, PathBuf};

use rand::Rng;

use super::annotations::TextOcrAnnotations;
use super::transforms::{letterbox_to_chw, Normalization, RandomRotation};
use crate::boxes::{AnchorSet, BBox, Letterbox};
use crate::error::{DetectionError, Result};

/// One loaded, letterboxed image with its boxes split per detection scale.
#[derive(Debug, Clone)]
pub struct DetectionSample {
    /// Normalised `[3, S, S]` pixels, CHW.
    pub image: Vec<f32>,
    pub canvas: usize,
    /// `boxes[s]` holds the canvas-space boxes assigned to scale `s`.
    pub boxes: Vec<Vec<BBox>>,
    pub path: PathBuf,
    pub letterbox: Letterbox,
}

impl DetectionSample {
    pub fn num_boxes(&self) -> usize {
        self.boxes.iter().map(Vec::len).sum()
    }

    /// Boxes of every scale in one list.
    pub fn all_boxes(&self) -> Vec<BBox> {
        self.boxes.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    boxes: Vec<BBox>,
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub canvas: u32,
    pub normalization: Normalization,
    /// Random letterbox offsets and rotation.
    pub augment: bool,
    pub rotation: RandomRotation,
}

/// Detection dataset over a TextOCR annotation file.
#[derive(Debug, Clone)]
pub struct DetectionDataset {
    entries: Vec<Entry>,
    anchors: AnchorSet,
    options: DatasetOptions,
}

impl DetectionDataset {
    pub fn new(
        annotations: &TextOcrAnnotations,
        image_dir: &Path,
        anchors: AnchorSet,
        options: DatasetOptions,
    ) -> Self {
        let mut entries = Vec::new();
        let mut skipped = 0usize;

        for image_id in annotations.image_ids() {
            let Some(path) = annotations.image_path(image_dir, image_id) else {
                continue;
            };

            let mut boxes = Vec::new();
            for ann in annotations.annotations_for(image_id) {
                match ann.to_bbox() {
                    Ok(b) if b.is_valid() => boxes.push(b),
                    Ok(_) => skipped += 1,
                    Err(e) => {
                        log::warn!("Skipping annotation {}: {}", ann.id, e);
                        skipped += 1;
                    }
                }
            }
            entries.push(Entry { path, boxes });
        }

        log::info!(
            "DetectionDataset: {} images from {} ({} annotations skipped)",
            entries.len(),
            image_dir.display(),
            skipped
        );

        Self {
            entries,
            anchors,
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn canvas(&self) -> u32 {
        self.options.canvas
    }

    pub fn num_scales(&self) -> usize {
        self.anchors.num_scales()
    }

    pub fn path(&self, idx: usize) -> Option<&Path> {
        self.entries.get(idx).map(|e| e.path.as_path())
    }

    /// Loads sample `idx`. An unreadable image is reported as `Ok(None)` so
    /// the caller can drop it from the batch.
    pub fn get<R: Rng + ?Sized>(&self, idx: usize, rng: &mut R) -> Result<Option<DetectionSample>> {
        let entry = self.entries.get(idx).ok_or_else(|| {
            DetectionError::shape("dataset index", format!("< {}", self.entries.len()), idx)
        })?;

        let img = match image::open(&entry.path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("Dropping unreadable image {}: {}", entry.path.display(), e);
                return Ok(None);
            }
        };

        let angle = if self.options.augment {
            self.options.rotation.sample_angle(rng)
        } else {
            0.0
        };
        let img = RandomRotation::rotate_image(&img, angle);
        let (width, height) = img.dimensions();

        let canvas = self.options.canvas;
        let letterbox = if self.options.augment {
            Letterbox::random(width, height, canvas, rng)?
        } else {
            Letterbox::centered(width, height, canvas)?
        };

        let boxes = entry
            .boxes
            .iter()
            .map(|b| RandomRotation::rotate_bbox(width, height, b, angle))
            .map(|b| letterbox.apply(&b).clamp_to(0.0, canvas as f32))
            .filter(BBox::is_valid)
            .collect::<Vec<_>>();

        Ok(Some(DetectionSample {
            image: letterbox_to_chw(&img, &letterbox, &self.options.normalization),
            canvas: canvas as usize,
            boxes: split_by_scale(&boxes, &self.anchors),
            path: entry.path.clone(),
            letterbox,
        }))
    }
}

/// Groups boxes by the scale of their best-matching anchor.
pub fn split_by_scale(boxes: &[BBox], anchors: &AnchorSet) -> Vec<Vec<BBox>> {
    let mut groups = vec![Vec::new(); anchors.num_scales()];
    for b in boxes {
        let (scale, _, _) = anchors.best_match(b.width(), b.height());
        groups[scale].push(*b);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn anchors() -> AnchorSet {
        AnchorSet::new(vec![[8.0, 4.0], [16.0, 8.0], [32.0, 16.0]], 1).unwrap()
    }

    #[test]
    fn test_split_by_scale() {
        let boxes = vec![
            BBox::new(0.0, 0.0, 30.0, 15.0),
            BBox::new(0.0, 0.0, 8.0, 4.0),
            BBox::new(5.0, 5.0, 21.0, 13.0),
            BBox::new(0.0, 0.0, 9.0, 5.0),
        ];
        let groups = split_by_scale(&boxes, &anchors());
        assert_eq!(groups[0], vec![boxes[1], boxes[3]]);
        assert_eq!(groups[1], vec![boxes[2]]);
        assert_eq!(groups[2], vec![boxes[0]]);
    }

    fn write_fixture(dir: &Path) -> TextOcrAnnotations {
        RgbImage::from_pixel(64, 32, Rgb([200, 10, 10]))
            .save(dir.join("wide.png"))
            .unwrap();
        let json = r#"{
            "imgs": {
                "wide": {"id": "wide", "width": 64, "height": 32, "file_name": "wide.png"},
                "gone": {"id": "gone", "width": 10, "height": 10, "file_name": "gone.png"}
            },
            "anns": {
                "w1": {"id": "w1", "image_id": "wide", "bbox": [8, 8, 16, 8], "utf8_string": "ab"},
                "w2": {"id": "w2", "image_id": "wide", "bbox": [1, 1, 1, 1],
                       "points": [3, 3], "utf8_string": "x"}
            },
            "imgToAnns": {"wide": ["w1", "w2"], "gone": []}
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_load_and_letterbox() {
        let dir = tempfile::tempdir().unwrap();
        let ann = write_fixture(dir.path());
        let options = DatasetOptions {
            canvas: 32,
            normalization: Normalization::default(),
            augment: false,
            rotation: RandomRotation::default(),
        };
        let dataset = DetectionDataset::new(&ann, dir.path(), anchors(), options);
        assert_eq!(dataset.len(), 2);

        let mut rng = StdRng::seed_from_u64(0);
        // "gone" sorts first and has no file on disk
        assert!(dataset.get(0, &mut rng).unwrap().is_none());

        let sample = dataset.get(1, &mut rng).unwrap().unwrap();
        assert_eq!(sample.image.len(), 3 * 32 * 32);
        assert_eq!(sample.letterbox.pad_y, 8);
        // degenerate polygon annotation is dropped, the other is halved and shifted
        assert_eq!(sample.all_boxes(), vec![BBox::new(4.0, 12.0, 12.0, 16.0)]);
        assert!(dataset.get(2, &mut rng).is_err());
    }
}
