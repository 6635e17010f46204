use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{DatasetOptions, LoaderOptions, Normalization, RandomRotation};
use crate::error::{DetectionError, Result};
use crate::model::{LossWeights, ModelConfig};
use crate::postprocess::PostProcessor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Dataset
    pub train_annotations: String,
    pub train_images: String,
    pub val_annotations: String,
    pub val_images: String,
    pub anchors_path: String,
    pub desired_size: u32,
    pub normalization: Normalization,
    pub augment: bool,
    pub rotation: RandomRotation,

    // Model
    pub model: ModelConfig,
    pub loss: LossWeights,

    // Training
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub warmup_epochs: usize,
    /// Explicit per-epoch warmup rates; overrides the linear ramp when set.
    pub warmup_lr_sequence: Vec<f64>,

    // Post-processing and metric
    pub conf_threshold: f32,
    pub nms_thresholds: Vec<f32>,
    pub metric_iou_threshold: f32,

    // Visualisation
    pub vis_first_batch: usize,
    pub vis_interval: usize,
    pub vis_sample: usize,
    pub vis_dir: String,

    // Early stopping on validation loss; 0 disables it
    pub patience: usize,
    pub min_delta: f32,

    // Checkpointing
    pub save_dir: String,
    pub save_interval: usize,

    // Loading
    pub workers: usize,
    pub queue_depth: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_annotations: "data/TextOCR_0.1_train.json".to_string(),
            train_images: "data/train_images".to_string(),
            val_annotations: "data/TextOCR_0.1_val.json".to_string(),
            val_images: "data/train_images".to_string(),
            anchors_path: "anchor_boxes.json".to_string(),
            desired_size: 1024,
            normalization: Normalization::default(),
            augment: true,
            rotation: RandomRotation::default(),
            model: ModelConfig::default(),
            loss: LossWeights::default(),
            epochs: 50,
            batch_size: 4,
            learning_rate: 0.001,
            weight_decay: 0.0005,
            warmup_epochs: 3,
            warmup_lr_sequence: Vec::new(),
            conf_threshold: 0.5,
            nms_thresholds: vec![0.7, 0.3],
            metric_iou_threshold: 0.5,
            vis_first_batch: 1,
            vis_interval: 10,
            vis_sample: 0,
            vis_dir: "runs/text_detection/visualizations".to_string(),
            patience: 10,
            min_delta: 0.001,
            save_dir: "runs/text_detection".to_string(),
            save_interval: 10,
            workers: 2,
            queue_depth: 4,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DetectionError::io(path, e))?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DetectionError::io(parent, e))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| DetectionError::io(path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.desired_size == 0 || self.desired_size % 32 != 0 {
            return Err(DetectionError::InvalidConfig(format!(
                "desired_size must be a positive multiple of 32, got {}",
                self.desired_size
            )));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(DetectionError::InvalidConfig(
                "epochs and batch_size must be positive".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(DetectionError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        let unit = |v: f32| (0.0..=1.0).contains(&v);
        if !unit(self.conf_threshold) || !unit(self.metric_iou_threshold) {
            return Err(DetectionError::InvalidConfig(
                "conf_threshold and metric_iou_threshold must lie in [0, 1]".to_string(),
            ));
        }
        if self.nms_thresholds.iter().any(|&t| !unit(t)) {
            return Err(DetectionError::InvalidConfig(format!(
                "nms thresholds must lie in [0, 1], got {:?}",
                self.nms_thresholds
            )));
        }
        if self.vis_interval == 0 || self.save_interval == 0 {
            return Err(DetectionError::InvalidConfig(
                "vis_interval and save_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Visualise on `vis_first_batch` and every `vis_interval`-th batch
    /// (0-based batch index).
    pub fn visualize_at(&self, batch_idx: usize) -> bool {
        batch_idx == self.vis_first_batch || batch_idx % self.vis_interval == 0
    }

    pub fn post_processor(&self) -> PostProcessor {
        PostProcessor::new(
            self.conf_threshold,
            self.nms_thresholds.clone(),
            self.desired_size as usize,
        )
    }

    pub fn dataset_options(&self, augment: bool) -> DatasetOptions {
        DatasetOptions {
            canvas: self.desired_size,
            normalization: self.normalization,
            augment: augment && self.augment,
            rotation: self.rotation,
        }
    }

    pub fn loader_options(&self, shuffle: bool) -> LoaderOptions {
        LoaderOptions {
            batch_size: self.batch_size,
            shuffle,
            seed: self.seed,
            workers: self.workers,
            queue_depth: self.queue_depth,
        }
    }

    pub fn checkpoint_dir(&self, name: &str) -> PathBuf {
        Path::new(&self.save_dir).join(name)
    }
}
