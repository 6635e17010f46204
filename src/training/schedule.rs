use crate::error::{DetectionError, Result};

/// Per-epoch learning rate: a warmup sequence for the first epochs, then the
/// base rate.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupSchedule {
    base_lr: f64,
    warmup: Vec<f64>,
}

impl WarmupSchedule {
    /// Ramps linearly from `base_lr / (warmup_epochs + 1)` up to just below
    /// `base_lr`.
    pub fn linear(base_lr: f64, warmup_epochs: usize) -> Self {
        let steps = warmup_epochs as f64 + 1.0;
        let warmup = (1..=warmup_epochs).map(|e| base_lr * e as f64 / steps).collect();
        Self { base_lr, warmup }
    }

    pub fn from_sequence(base_lr: f64, sequence: Vec<f64>) -> Result<Self> {
        if let Some(bad) = sequence.iter().find(|lr| !lr.is_finite() || **lr <= 0.0) {
            return Err(DetectionError::InvalidConfig(format!(
                "warmup learning rate must be positive, got {}",
                bad
            )));
        }
        Ok(Self {
            base_lr,
            warmup: sequence,
        })
    }

    pub fn warmup_epochs(&self) -> usize {
        self.warmup.len()
    }

    /// Rate for 1-based `epoch`.
    pub fn lr(&self, epoch: usize) -> f64 {
        epoch
            .checked_sub(1)
            .and_then(|e| self.warmup.get(e))
            .copied()
            .unwrap_or(self.base_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_warmup() {
        let schedule = WarmupSchedule::linear(0.004, 3);
        let lrs: Vec<f64> = (1..=5).map(|e| schedule.lr(e)).collect();
        let expected = [0.001, 0.002, 0.003, 0.004, 0.004];
        for (lr, want) in lrs.iter().zip(expected) {
            assert!((lr - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_explicit_sequence() {
        let schedule = WarmupSchedule::from_sequence(0.01, vec![1e-4, 1e-3]).unwrap();
        assert_eq!(schedule.warmup_epochs(), 2);
        assert_eq!(schedule.lr(1), 1e-4);
        assert_eq!(schedule.lr(2), 1e-3);
        assert_eq!(schedule.lr(3), 0.01);
        assert!(WarmupSchedule::from_sequence(0.01, vec![0.0]).is_err());
    }

    #[test]
    fn test_no_warmup() {
        let schedule = WarmupSchedule::linear(0.01, 0);
        assert_eq!(schedule.lr(1), 0.01);
    }
}
