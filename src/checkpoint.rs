//! Versioned checkpoint directories: `checkpoint.json` next to the weights
//! written by burn's `BinFileRecorder`.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use serde::{Deserialize, Serialize};

use crate::boxes::AnchorSet;
use crate::data::Normalization;
use crate::error::{DetectionError, Result};
use crate::model::{ModelConfig, TextDetector};
use crate::training::EpochMetrics;

pub const FORMAT_VERSION: u32 = 1;
pub const META_FILE: &str = "checkpoint.json";
/// Weights stem; the recorder appends `.bin`.
pub const WEIGHTS_STEM: &str = "model";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    /// Weights file, relative to the checkpoint directory.
    pub model_state_dict: String,
    pub model_config: ModelConfig,
    pub desired_size: u32,
    #[serde(default)]
    pub normalization: Normalization,
    pub epoch: usize,
    /// Anchor templates the model was trained with, flattened group by group.
    #[serde(default)]
    pub anchors: Vec<[f32; 2]>,
    /// Parameter count of the saved model, filled in by [`save`].
    #[serde(default)]
    pub num_params: Option<usize>,
    #[serde(default)]
    pub train: Option<EpochMetrics>,
    #[serde(default)]
    pub val: Option<EpochMetrics>,
}

impl CheckpointMeta {
    pub fn new(model_config: ModelConfig, desired_size: u32, normalization: Normalization, epoch: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model_state_dict: format!("{}.bin", WEIGHTS_STEM),
            model_config,
            desired_size,
            normalization,
            epoch,
            anchors: Vec::new(),
            num_params: None,
            train: None,
            val: None,
        }
    }

    pub fn with_metrics(mut self, train: EpochMetrics, val: EpochMetrics) -> Self {
        self.train = Some(train);
        self.val = Some(val);
        self
    }

    pub fn with_anchors(mut self, anchors: &AnchorSet) -> Self {
        self.anchors = anchors.all().to_vec();
        self
    }

    /// The stored anchor set, checked against the model's active scales.
    /// `None` for checkpoints written without anchors.
    pub fn anchor_set(&self) -> Result<Option<AnchorSet>> {
        if self.anchors.is_empty() {
            return Ok(None);
        }
        let anchors = AnchorSet::new(self.anchors.clone(), self.model_config.anchors_per_scale)?;
        anchors.check_scales(self.model_config.scales().len())?;
        Ok(Some(anchors))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| DetectionError::io(&path, e))?;
        let meta: CheckpointMeta = serde_json::from_str(&content).map_err(|e| DetectionError::json(&path, e))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(DetectionError::Checkpoint(format!(
                "{} has format version {}, expected {}",
                path.display(),
                meta.format_version,
                FORMAT_VERSION
            )));
        }
        if meta.desired_size == 0 {
            return Err(DetectionError::Checkpoint(format!(
                "{} has a zero desired_size",
                path.display()
            )));
        }
        Ok(meta)
    }

    fn weights_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.model_state_dict).with_extension("")
    }
}

/// Writes `model` and `meta` into `dir`, creating it if needed. The stored
/// metadata records the model's parameter count.
pub fn save<B: Backend>(model: &TextDetector<B>, dir: &Path, meta: &CheckpointMeta) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| DetectionError::io(dir, e))?;
    let meta = CheckpointMeta {
        num_params: Some(model.num_params()),
        ..meta.clone()
    };

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(meta.weights_path(dir), &recorder)
        .map_err(|e| DetectionError::Checkpoint(format!("failed to save weights: {:?}", e)))?;

    let meta_path = dir.join(META_FILE);
    let json = serde_json::to_string_pretty(&meta).map_err(|e| DetectionError::json(&meta_path, e))?;
    std::fs::write(&meta_path, json).map_err(|e| DetectionError::io(&meta_path, e))?;

    log::info!("Checkpoint saved to {}", dir.display());
    Ok(dir.to_path_buf())
}

/// Rebuilds the model from the stored config and loads its weights. Any
/// failure, including a parameter count that disagrees with the config, is
/// an error; there is no fallback to fresh weights.
pub fn load<B: Backend>(dir: &Path, device: &B::Device) -> Result<(TextDetector<B>, CheckpointMeta)> {
    let meta = CheckpointMeta::load(dir)?;
    meta.anchor_set()?;
    let model = TextDetector::<B>::new(device, &meta.model_config)?;
    let expected = model.num_params();
    if let Some(saved) = meta.num_params {
        if saved != expected {
            return Err(DetectionError::Checkpoint(format!(
                "weights in {} hold {} parameters, model_config builds {}",
                dir.display(),
                saved,
                expected
            )));
        }
    }

    let weights = meta.weights_path(dir);
    if !weights.with_extension("bin").exists() {
        return Err(DetectionError::Checkpoint(format!(
            "missing weights {}",
            dir.join(&meta.model_state_dict).display()
        )));
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(weights, &recorder, device)
        .map_err(|e| DetectionError::Checkpoint(format!("failed to load weights: {:?}", e)))?;

    let loaded = model.num_params();
    if loaded != expected {
        return Err(DetectionError::Checkpoint(format!(
            "weights hold {} parameters, config expects {}",
            loaded, expected
        )));
    }

    log::info!(
        "Loaded checkpoint {} (epoch {})",
        dir.display(),
        meta.epoch
    );
    Ok((model, meta))
}
