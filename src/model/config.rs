use serde::{Deserialize, Serialize};

use crate::error::{DetectionError, Result};

/// Detection scales, finest grid first. Head outputs and anchor groups follow
/// this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionScale {
    Small,
    Medium,
    Large,
}

impl DetectionScale {
    pub const ALL: [DetectionScale; 3] = [Self::Small, Self::Medium, Self::Large];

    pub fn stride(self) -> usize {
        match self {
            Self::Small => 8,
            Self::Medium => 16,
            Self::Large => 32,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Medium => 1,
            Self::Large => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Extra class channels after `(tx, ty, tw, th, conf)`.
    pub num_classes: usize,
    pub anchors_per_scale: usize,
    pub active_scales: Vec<DetectionScale>,

    /// Backbone: stem width, then five stride-2 stages.
    pub stem_channels: usize,
    pub stage_channels: Vec<usize>,
    pub stage_depths: Vec<usize>,

    pub negative_slope: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Darknet-53 widths and depths
        Self {
            num_classes: 1,
            anchors_per_scale: 3,
            active_scales: DetectionScale::ALL.to_vec(),
            stem_channels: 32,
            stage_channels: vec![64, 128, 256, 512, 1024],
            stage_depths: vec![1, 2, 8, 8, 4],
            negative_slope: 0.1,
        }
    }
}

impl ModelConfig {
    pub const NUM_STAGES: usize = 5;

    /// Values per anchor in a head output.
    pub fn entry_size(&self) -> usize {
        5 + self.num_classes
    }

    pub fn head_channels(&self) -> usize {
        self.anchors_per_scale * self.entry_size()
    }

    /// Backbone width at the stride of `scale`; 0 for an unvalidated config
    /// with too few stages.
    pub fn backbone_channels(&self, scale: DetectionScale) -> usize {
        self.stage_channels.get(scale.index() + 2).copied().unwrap_or(0)
    }

    /// Active scales sorted finest first, without duplicates.
    pub fn scales(&self) -> Vec<DetectionScale> {
        let mut scales = self.active_scales.clone();
        scales.sort();
        scales.dedup();
        scales
    }

    pub fn validate(&self) -> Result<()> {
        if self.anchors_per_scale == 0 {
            return Err(DetectionError::InvalidConfig(
                "anchors_per_scale must be positive".to_string(),
            ));
        }
        if self.active_scales.is_empty() {
            return Err(DetectionError::InvalidConfig(
                "at least one detection scale must be active".to_string(),
            ));
        }
        if self.stage_channels.len() != Self::NUM_STAGES || self.stage_depths.len() != Self::NUM_STAGES {
            return Err(DetectionError::InvalidConfig(format!(
                "backbone needs {} stages, got {} widths and {} depths",
                Self::NUM_STAGES,
                self.stage_channels.len(),
                self.stage_depths.len()
            )));
        }
        if self.stem_channels == 0 || self.stage_channels.iter().any(|&c| c < 2) {
            return Err(DetectionError::InvalidConfig(
                "backbone channel counts must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Small configuration used by tests and quick experiments.
    pub fn tiny() -> Self {
        Self {
            num_classes: 1,
            anchors_per_scale: 3,
            active_scales: DetectionScale::ALL.to_vec(),
            stem_channels: 4,
            stage_channels: vec![8, 8, 8, 8, 8],
            stage_depths: vec![1, 1, 1, 1, 1],
            negative_slope: 0.1,
        }
    }
}
