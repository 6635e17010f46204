use std::path::Path;

use serde::{Deserialize, Serialize};

use super::metrics::EpochMetrics;
use crate::error::{DetectionError, Result};

/// Summary of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
    pub seconds: f32,
}

/// Per-run context owned by the trainer. Nothing here outlives the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub history: Vec<EpochRecord>,
    /// `(epoch, validation loss)` of the best checkpoint so far.
    pub best: Option<(usize, f32)>,
    /// Optimiser steps taken across all epochs.
    pub steps: usize,
    /// Visualisation images written during the run.
    pub visualizations: usize,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.history.last()
    }

    /// Appends `record`; returns `true` when its validation loss is the best
    /// finite one seen so far.
    pub fn push(&mut self, record: EpochRecord) -> bool {
        let loss = record.val.loss;
        let improved = loss.is_finite() && self.best.map_or(true, |(_, best)| loss < best);
        if improved {
            self.best = Some((record.epoch, loss));
        }
        log::debug!("epoch {} recorded, history len {}", record.epoch, self.history.len() + 1);
        self.history.push(record);
        improved
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| DetectionError::json(path, e))?;
        std::fs::write(path, json).map_err(|e| DetectionError::io(path, e))
    }
}
