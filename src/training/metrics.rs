use serde::{Deserialize, Serialize};

use crate::boxes::BBox;
use crate::error::{DetectionError, Result};

/// Ground-truth boxes of one image that were found by the predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchCount {
    pub found: usize,
    pub total: usize,
}

impl std::ops::AddAssign for MatchCount {
    fn add_assign(&mut self, rhs: Self) {
        self.found += rhs.found;
        self.total += rhs.total;
    }
}

/// Matches every ground-truth box to its best-overlapping prediction. A box
/// counts as found when that IoU is strictly greater than `iou_threshold`.
///
/// All-zero ground-truth rows are padding and are skipped, so an image
/// without boxes contributes `0 / 0`.
pub fn match_ground_truth(predictions: &[BBox], ground_truth: &[BBox], iou_threshold: f32) -> MatchCount {
    let mut count = MatchCount::default();
    for gt in ground_truth.iter().filter(|b| !b.is_zero()) {
        count.total += 1;
        let best = predictions
            .iter()
            .map(|p| p.iou(gt))
            .fold(0.0f32, f32::max);
        if best > iou_threshold {
            count.found += 1;
        }
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Mean loss per image.
    pub loss: f32,
    /// Found / total ground-truth boxes, in `[0, 1]`.
    pub accuracy: f32,
    pub images: usize,
    pub boxes: usize,
}

/// Running loss and IoU-accuracy totals of one epoch. Batch losses are
/// weighted by the batch's image count so a short tail batch does not skew
/// the mean.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    images: usize,
    matches: MatchCount,
    skipped: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, loss: f32, images: usize, matches: MatchCount) {
        self.loss_sum += loss as f64 * images as f64;
        self.images += images;
        self.matches += matches;
    }

    /// Records a batch dropped for a non-finite loss.
    pub fn skip_batch(&mut self) {
        self.skipped += 1;
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn images(&self) -> usize {
        self.images
    }

    /// Running mean loss, for progress display.
    pub fn mean_loss(&self) -> Option<f32> {
        (self.images > 0).then(|| (self.loss_sum / self.images as f64) as f32)
    }

    /// Divides once over the epoch totals; both must be non-zero.
    pub fn finish(&self, phase: &'static str) -> Result<EpochMetrics> {
        if self.images == 0 || self.matches.total == 0 {
            return Err(DetectionError::EmptyEpoch(phase));
        }
        Ok(EpochMetrics {
            loss: (self.loss_sum / self.images as f64) as f32,
            accuracy: self.matches.found as f32 / self.matches.total as f32,
            images: self.images,
            boxes: self.matches.total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_half_iou_is_not_found() {
        // prediction covers half of the ground truth: IoU = 50 / 100
        let gt = BBox::new(0.0, 0.0, 10.0, 10.0);
        let pred = BBox::new(0.0, 0.0, 10.0, 5.0);
        assert!((pred.iou(&gt) - 0.5).abs() < 1e-6);

        let count = match_ground_truth(&[pred], &[gt], 0.5);
        assert_eq!(count, MatchCount { found: 0, total: 1 });

        let count = match_ground_truth(&[pred], &[gt], 0.49);
        assert_eq!(count, MatchCount { found: 1, total: 1 });
    }

    #[test]
    fn test_best_prediction_is_used() {
        let gts = [BBox::new(0.0, 0.0, 10.0, 10.0), BBox::new(50.0, 50.0, 60.0, 60.0)];
        let preds = [
            BBox::new(100.0, 100.0, 110.0, 110.0),
            BBox::new(0.5, 0.0, 10.0, 10.0),
        ];
        let count = match_ground_truth(&preds, &gts, 0.5);
        assert_eq!(count, MatchCount { found: 1, total: 2 });
    }

    #[test]
    fn test_padding_and_empty_images() {
        let gts = [BBox::new(0.0, 0.0, 4.0, 4.0), BBox::zero(), BBox::zero()];
        assert_eq!(match_ground_truth(&[], &gts, 0.5), MatchCount { found: 0, total: 1 });
        assert_eq!(
            match_ground_truth(&[BBox::new(0.0, 0.0, 4.0, 4.0)], &[BBox::zero()], 0.5),
            MatchCount::default()
        );
    }

    #[test]
    fn test_size_weighted_epoch() {
        let mut acc = EpochAccumulator::new();
        acc.add_batch(1.0, 4, MatchCount { found: 3, total: 4 });
        acc.add_batch(4.0, 1, MatchCount { found: 0, total: 0 });
        acc.add_batch(2.0, 1, MatchCount { found: 1, total: 4 });

        let metrics = acc.finish("test").unwrap();
        assert!((metrics.loss - 10.0 / 6.0).abs() < 1e-6);
        assert!((metrics.accuracy - 0.5).abs() < 1e-6);
        assert_eq!(metrics.images, 6);
        assert_eq!(metrics.boxes, 8);
    }

    #[test]
    fn test_empty_epoch_is_an_error() {
        assert!(matches!(
            EpochAccumulator::new().finish("validation"),
            Err(DetectionError::EmptyEpoch("validation"))
        ));

        let mut acc = EpochAccumulator::new();
        acc.add_batch(1.0, 2, MatchCount::default());
        assert!(acc.finish("validation").is_err());
        assert_eq!(acc.mean_loss(), Some(1.0));
    }
}
