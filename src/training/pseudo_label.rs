//! Pseudo-Labeling for FixMatch
//!
//! The weakly augmented view of an unlabeled image proposes a label; the
//! strongly augmented view is trained against it, but only where the
//! proposal is confident enough.
//!
//! ## Algorithm Overview
//!
//! 1. Detach the weak-view logits from the graph
//! 2. Softmax, then take the max probability and its class per row
//! 3. Mask rows whose confidence clears the threshold
//! 4. Masked cross entropy of the strong-view logits against those labels

use burn::tensor::{activation::softmax, backend::Backend, Int, Tensor};
use serde::{Deserialize, Serialize};

use super::loss::cross_entropy_per_example;

/// Configuration for pseudo-labeling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoLabelConfig {
    /// Confidence a weak-view prediction needs to become a training target
    pub threshold: f64,
}

impl Default for PseudoLabelConfig {
    fn default() -> Self {
        Self { threshold: 0.95 }
    }
}

/// Labels proposed for one unlabeled batch
#[derive(Debug, Clone)]
pub struct PseudoLabels<B: Backend> {
    /// Argmax class per example, `[batch]`
    pub labels: Tensor<B, 1, Int>,
    /// Max softmax probability per example, `[batch]`
    pub confidence: Tensor<B, 1>,
    /// 1.0 where `confidence >= threshold`, else 0.0
    pub mask: Tensor<B, 1>,
}

impl<B: Backend> PseudoLabels<B> {
    /// Fraction of the batch that passed the threshold, as a one-element tensor
    pub fn mask_rate(&self) -> Tensor<B, 1> {
        self.mask.clone().mean()
    }
}

/// Turns weak-view logits into confidence-gated pseudo-labels
#[derive(Debug, Clone)]
pub struct PseudoLabeler {
    config: PseudoLabelConfig,
}

impl PseudoLabeler {
    pub fn new(config: PseudoLabelConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Propose labels from weak-view logits `[batch, classes]`.
    ///
    /// The logits are detached first, so no gradient flows back through the
    /// view that generates the label.
    pub fn generate<B: Backend>(&self, weak_logits: Tensor<B, 2>) -> PseudoLabels<B> {
        let [batch, _] = weak_logits.dims();
        let probs = softmax(weak_logits.detach(), 1);
        let (confidence, labels) = probs.max_dim_with_indices(1);
        let confidence = confidence.reshape([batch]);
        let labels = labels.reshape([batch]);

        let mask = confidence
            .clone()
            .greater_equal_elem(self.config.threshold)
            .float();

        PseudoLabels {
            labels,
            confidence,
            mask,
        }
    }

    /// Mean over the batch of `mask[i] * CE(strong_logits[i], label[i])`.
    ///
    /// Masked-out rows contribute exactly zero, and they still count in the
    /// denominator.
    pub fn unsupervised_loss<B: Backend>(
        &self,
        strong_logits: Tensor<B, 2>,
        pseudo: &PseudoLabels<B>,
    ) -> Tensor<B, 1> {
        let per_example = cross_entropy_per_example(strong_logits, pseudo.labels.clone());
        (per_example * pseudo.mask.clone()).mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::tensor_to_vec;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type B = NdArray;

    /// Logits whose softmax is exactly the given distribution (up to rounding)
    fn logits_from_probs(rows: &[[f32; 3]]) -> Tensor<B, 2> {
        let values: Vec<f32> = rows.iter().flat_map(|r| r.iter().map(|p| p.ln())).collect();
        Tensor::<B, 2>::from_data(TensorData::new(values, [rows.len(), 3]), &Default::default())
    }

    fn labeler() -> PseudoLabeler {
        PseudoLabeler::new(PseudoLabelConfig { threshold: 0.95 })
    }

    fn int_vec(t: Tensor<B, 1, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_confident_row_is_kept() {
        let pl = labeler().generate(logits_from_probs(&[[0.97, 0.02, 0.01]]));
        assert_eq!(int_vec(pl.labels), vec![0]);
        assert_eq!(tensor_to_vec(pl.mask).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_unconfident_row_is_masked_regardless_of_argmax() {
        let pl = labeler().generate(logits_from_probs(&[[0.5, 0.3, 0.2], [0.2, 0.3, 0.5]]));
        assert_eq!(int_vec(pl.labels), vec![0, 2]);
        assert_eq!(tensor_to_vec(pl.mask).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_mask_is_binary_and_matches_threshold() {
        let rows = [
            [0.97, 0.02, 0.01],
            [0.5, 0.3, 0.2],
            [0.01, 0.98, 0.01],
            [0.90, 0.05, 0.05],
        ];
        let pl = labeler().generate(logits_from_probs(&rows));
        let mask = tensor_to_vec(pl.mask.clone()).unwrap();
        let confidence = tensor_to_vec(pl.confidence.clone()).unwrap();

        for (m, c) in mask.iter().zip(confidence.iter()) {
            assert!(*m == 0.0 || *m == 1.0);
            assert_eq!(*m == 1.0, (*c as f64) >= 0.95);
        }
        assert_eq!(tensor_to_vec(pl.mask_rate()).unwrap(), vec![0.5]);
    }

    #[test]
    fn test_masked_rows_contribute_nothing() {
        let device = Default::default();
        let pl = labeler().generate(logits_from_probs(&[[0.97, 0.02, 0.01], [0.5, 0.3, 0.2]]));

        // Second row's strong view is wildly wrong, which would dominate an unmasked loss
        let strong = Tensor::<B, 2>::from_data(
            TensorData::new(vec![5.0f32, 0.0, 0.0, -50.0, 0.0, 50.0], [2, 3]),
            &device,
        );
        let lu = tensor_to_vec(labeler().unsupervised_loss(strong.clone(), &pl)).unwrap()[0];

        let only_first = cross_entropy_per_example(
            strong.narrow(0, 0, 1),
            Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64], [1]), &device),
        );
        let expected = tensor_to_vec(only_first).unwrap()[0] / 2.0;
        assert!((lu - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nothing_passes_gives_zero_loss() {
        let pl = PseudoLabeler::new(PseudoLabelConfig { threshold: 1.1 })
            .generate(logits_from_probs(&[[0.97, 0.02, 0.01]]));
        let strong = logits_from_probs(&[[0.1, 0.1, 0.8]]);
        let lu = tensor_to_vec(labeler().unsupervised_loss(strong, &pl)).unwrap();
        assert_eq!(lu, vec![0.0]);
    }

    #[test]
    fn test_no_gradient_through_weak_logits() {
        type AD = Autodiff<NdArray>;
        let device = Default::default();
        let weak = Tensor::<AD, 2>::from_data(
            TensorData::new(vec![4.0f32, 0.0, 0.0], [1, 3]),
            &device,
        )
        .require_grad();
        let strong = Tensor::<AD, 2>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 0.0], [1, 3]),
            &device,
        )
        .require_grad();

        let pl = PseudoLabeler::new(PseudoLabelConfig { threshold: 0.5 }).generate(weak.clone());
        let loss = labeler().unsupervised_loss(strong.clone(), &pl);
        let grads = loss.backward();

        assert!(strong.grad(&grads).is_some());
        assert!(weak.grad(&grads).is_none());
    }
}
