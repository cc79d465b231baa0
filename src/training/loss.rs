//! Cross-entropy helpers
//!
//! The batch-mean loss is Burn's `CrossEntropyLoss`. The per-example form is
//! only needed where a mask weights individual rows, as in the unlabeled
//! loss.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::{activation::log_softmax, backend::Backend, Int, Tensor};

/// Cross entropy of each row of `logits` against its integer target, `[batch]`
pub fn cross_entropy_per_example<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    log_probs
        .gather(1, targets.reshape([batch, 1]))
        .reshape([batch])
        .neg()
}

/// Mean cross entropy over the batch, as a one-element tensor
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::tensor_to_vec;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray;

    #[test]
    fn test_uniform_logits_give_log_k() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::zeros([2, 4], &device);
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64, 3], [2]), &device);

        let per_example = tensor_to_vec(cross_entropy_per_example(logits.clone(), targets.clone())).unwrap();
        for v in per_example {
            assert!((v - 4f32.ln()).abs() < 1e-6);
        }
        let mean = tensor_to_vec(cross_entropy(logits, targets)).unwrap();
        assert!((mean[0] - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_confident_correct_prediction_has_small_loss() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(
            TensorData::new(vec![10.0f32, 0.0, 0.0, 0.0, 10.0, 0.0], [2, 3]),
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64, 0], [2]), &device);

        let per_example = tensor_to_vec(cross_entropy_per_example(logits, targets)).unwrap();
        assert!(per_example[0] < 1e-3);
        assert!(per_example[1] > 9.0);
    }

    #[test]
    fn test_batch_mean_agrees_with_per_example() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.5f32, -0.5, 0.2, 0.0, 2.0, -1.0, 0.3, 0.3, 0.9], [3, 3]),
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![2i64, 1, 0], [3]), &device);

        let per_example = tensor_to_vec(cross_entropy_per_example(logits.clone(), targets.clone())).unwrap();
        let expected = per_example.iter().sum::<f32>() / 3.0;
        let mean = tensor_to_vec(cross_entropy(logits, targets)).unwrap();
        assert!((mean[0] - expected).abs() < 1e-5);
    }
}
