//! Metrics Module
//!
//! Running-average meters for per-epoch scalar reporting and top-k accuracy
//! over host-side logits.

use serde::{Deserialize, Serialize};

/// Running average of a scalar statistic.
///
/// `update(value, n)` counts `value` as the mean of `n` observations, so
/// batch-level means can be combined into a dataset-level mean weighted by
/// batch size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AverageMeter {
    /// Most recent value
    pub val: f64,
    /// Weighted sum of all values
    pub sum: f64,
    /// Total weight seen
    pub count: usize,
    /// sum / count
    pub avg: f64,
}

impl AverageMeter {
    /// Create an empty meter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the mean of `n` observations
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
        self.avg = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
    }

    /// Reset to empty
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Percentage of rows whose target is among the `k` highest logits.
///
/// `logits` is row-major `[targets.len(), num_classes]`. Ties are broken
/// toward the lower class index.
pub fn top_k_accuracy(logits: &[f32], num_classes: usize, targets: &[usize], k: usize) -> f64 {
    if targets.is_empty() || num_classes == 0 {
        return 0.0;
    }
    let k = k.min(num_classes);

    let correct = targets
        .iter()
        .enumerate()
        .filter(|(row, &target)| {
            let scores = &logits[row * num_classes..(row + 1) * num_classes];
            let target_score = scores[target];
            // Rank of the target: classes that strictly beat it, plus lower-indexed ties
            let rank = scores
                .iter()
                .enumerate()
                .filter(|(c, &s)| s > target_score || (s == target_score && *c < target))
                .count();
            rank < k
        })
        .count();

    100.0 * correct as f64 / targets.len() as f64
}

/// Median of a slice; mean of the two middle values for even lengths.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_meter_weights_by_count() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 1);
        meter.update(4.0, 3);

        assert_eq!(meter.count, 4);
        assert!((meter.avg - 3.25).abs() < 1e-12);
        assert_eq!(meter.val, 4.0);

        meter.reset();
        assert_eq!(meter.count, 0);
        assert_eq!(meter.avg, 0.0);
    }

    #[test]
    fn test_top_k_accuracy() {
        // 3 rows, 4 classes
        let logits = vec![
            0.1, 0.7, 0.1, 0.1, // top1 = 1
            0.5, 0.1, 0.4, 0.0, // top1 = 0, top2 = {0, 2}
            0.0, 0.1, 0.2, 0.7, // top1 = 3
        ];
        let targets = vec![1, 2, 0];

        let top1 = top_k_accuracy(&logits, 4, &targets, 1);
        let top2 = top_k_accuracy(&logits, 4, &targets, 2);
        let top4 = top_k_accuracy(&logits, 4, &targets, 4);

        assert!((top1 - 100.0 / 3.0).abs() < 1e-9);
        assert!((top2 - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(top4, 100.0);
    }

    #[test]
    fn test_top_k_clamped_to_num_classes() {
        let logits = vec![0.9, 0.1];
        assert_eq!(top_k_accuracy(&logits, 2, &[1], 5), 100.0);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
