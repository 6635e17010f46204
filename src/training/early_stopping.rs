/// What one validation epoch meant for early stopping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// New best validation loss.
    Improved,
    /// No improvement for this many epochs in a row, still within patience.
    Stale(usize),
    /// Patience exhausted.
    Stop,
}

/// Validation-loss plateau detector.
///
/// An epoch improves only when its loss beats the best so far by more than
/// `min_delta`; NaN and infinite losses never improve. `patience == 0`
/// disables stopping.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best: Option<f32>,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta: min_delta.max(0.0),
            best: None,
            stale: 0,
        }
    }

    pub fn observe(&mut self, val_loss: f32) -> Verdict {
        let improved = val_loss.is_finite()
            && self.best.map_or(true, |best| val_loss < best - self.min_delta);
        if improved {
            self.best = Some(val_loss);
            self.stale = 0;
            return Verdict::Improved;
        }

        self.stale += 1;
        if self.patience > 0 && self.stale >= self.patience {
            log::info!(
                "Validation loss has not improved by more than {} for {} epochs (best {:?})",
                self.min_delta,
                self.stale,
                self.best
            );
            Verdict::Stop
        } else {
            Verdict::Stale(self.stale)
        }
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_once_patience_runs_out() {
        let mut es = EarlyStopping::new(2, 0.01);
        assert_eq!(es.observe(1.0), Verdict::Improved);
        // within min_delta of the best
        assert_eq!(es.observe(0.995), Verdict::Stale(1));
        assert_eq!(es.observe(f32::NAN), Verdict::Stop);
        assert_eq!(es.best(), Some(1.0));
    }

    #[test]
    fn test_improvement_clears_stale_count() {
        let mut es = EarlyStopping::new(3, 0.0);
        assert_eq!(es.observe(f32::INFINITY), Verdict::Stale(1));
        assert_eq!(es.observe(1.0), Verdict::Improved);
        assert_eq!(es.observe(1.5), Verdict::Stale(1));
        assert_eq!(es.observe(0.5), Verdict::Improved);
        assert_eq!(es.observe(0.5), Verdict::Stale(1));
    }

    #[test]
    fn test_zero_patience_never_stops() {
        let mut es = EarlyStopping::new(0, 0.0);
        es.observe(1.0);
        for n in 1..=5 {
            assert_eq!(es.observe(2.0), Verdict::Stale(n));
        }
    }
}
