/// Percent-complete markers for one pass over a loader, one per 5 %.
///
/// Owned by the epoch loop; a fresh value is created for every epoch.
#[derive(Debug, Clone)]
pub struct ProgressMarkers {
    total: usize,
    step: u32,
    next: u32,
}

impl ProgressMarkers {
    pub const STEP: u32 = 5;

    pub fn new(total_batches: usize) -> Self {
        Self {
            total: total_batches,
            step: Self::STEP,
            next: Self::STEP,
        }
    }

    /// Markers crossed after `completed` batches, in increasing order. Each
    /// marker is returned once.
    pub fn advance(&mut self, completed: usize) -> Vec<u32> {
        if self.total == 0 {
            return Vec::new();
        }
        let percent = (completed.min(self.total) * 100 / self.total) as u32;
        let mut crossed = Vec::new();
        while self.next <= 100 && percent >= self.next {
            crossed.push(self.next);
            self.next += self.step;
        }
        crossed
    }

    pub fn is_done(&self) -> bool {
        self.next > 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_five_percent() {
        let mut markers = ProgressMarkers::new(40);
        let mut seen = Vec::new();
        for done in 1..=40 {
            seen.extend(markers.advance(done));
        }
        assert_eq!(seen, (1..=20).map(|i| i * 5).collect::<Vec<u32>>());
        assert!(markers.is_done());
    }

    #[test]
    fn test_short_loader_emits_all_markers() {
        let mut markers = ProgressMarkers::new(3);
        assert_eq!(markers.advance(1), vec![5, 10, 15, 20, 25, 30]);
        assert_eq!(markers.advance(1), Vec::<u32>::new());
        assert_eq!(markers.advance(3).last(), Some(&100));
        assert!(ProgressMarkers::new(0).advance(5).is_empty());
    }
}
