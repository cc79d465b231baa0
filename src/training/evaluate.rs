//! Held-out evaluation
//!
//! One forward-only pass over the test batches. Loss and top-1/top-5
//! accuracy are averaged per example, so a short final batch weighs less.

use burn::tensor::{backend::Backend, ElementConversion};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use super::loss::cross_entropy;
use crate::dataset::LabeledBatch;
use crate::model::{Classifier, Mode};
use crate::utils::error::{FixMatchError, Result, ResultExt};
use crate::utils::metrics::{top_k_accuracy, AverageMeter};

/// Results of one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    /// Mean cross entropy
    pub loss: f64,
    /// Top-1 accuracy in percent
    pub top1: f64,
    /// Top-5 accuracy in percent (top-`num_classes` when there are fewer)
    pub top5: f64,
    pub num_examples: usize,
}

/// Evaluate `model` over `batches`. The model must already be in eval mode.
pub fn evaluate<B, C, I>(model: &C, batches: I, progress: &ProgressBar) -> Result<EvalSummary>
where
    B: Backend,
    C: Classifier<B>,
    I: IntoIterator<Item = LabeledBatch<B>>,
{
    if model.mode() != Mode::Eval {
        return Err(FixMatchError::Training(
            "Evaluation requires a model in eval mode".to_string(),
        ));
    }

    let num_classes = model.num_classes();
    let k = 5.min(num_classes);

    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();

    for batch in batches {
        let n = batch.targets.dims()[0];
        if n == 0 {
            continue;
        }

        let logits = model.forward(batch.images);
        let loss: f64 = cross_entropy(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();

        let logits: Vec<f32> = logits
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .context("Failed to read logits")?;
        let targets: Vec<usize> = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .context("Failed to read targets")?
            .into_iter()
            .map(|t| t as usize)
            .collect();

        losses.update(loss, n);
        top1.update(top_k_accuracy(&logits, num_classes, &targets, 1), n);
        top5.update(top_k_accuracy(&logits, num_classes, &targets, k), n);

        progress.inc(1);
        progress.set_message(format!("loss {:.4} top1 {:.2}", losses.avg, top1.avg));
    }
    progress.finish_and_clear();

    Ok(EvalSummary {
        loss: losses.avg,
        top1: top1.avg,
        top5: top5.avg,
        num_examples: losses.count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MlpClassifier, MlpClassifierConfig};
    use burn::backend::NdArray;
    use burn::tensor::{Int, Tensor, TensorData};

    type B = NdArray;

    fn batch(rows: usize, label: i64) -> LabeledBatch<B> {
        let device = Default::default();
        LabeledBatch {
            images: Tensor::<B, 4>::ones([rows, 1, 2, 2], &device),
            targets: Tensor::<B, 1, Int>::from_data(TensorData::new(vec![label; rows], [rows]), &device),
        }
    }

    fn model() -> MlpClassifier<B> {
        let mut model: MlpClassifier<B> = MlpClassifierConfig::new(4, 3)
            .with_hidden_dim(8)
            .init(&Default::default());
        model.set_mode(Mode::Eval);
        model
    }

    #[test]
    fn test_constant_input_scores_one_class() {
        let model = model();
        // Every image is identical, so every row predicts the same class
        let logits = model.forward(batch(1, 0).images);
        let predicted = logits.argmax(1).into_data().convert::<i64>().to_vec::<i64>().unwrap()[0];

        let right = evaluate(&model, vec![batch(3, predicted), batch(1, predicted)], &ProgressBar::hidden()).unwrap();
        assert_eq!(right.top1, 100.0);
        assert_eq!(right.top5, 100.0);
        assert_eq!(right.num_examples, 4);

        let wrong_label = (predicted + 1) % 3;
        let mixed = evaluate(&model, vec![batch(3, predicted), batch(1, wrong_label)], &ProgressBar::hidden()).unwrap();
        assert!((mixed.top1 - 75.0).abs() < 1e-9);
        // With three classes top-5 covers everything
        assert_eq!(mixed.top5, 100.0);
    }

    #[test]
    fn test_loss_is_weighted_by_batch_size() {
        let model = model();
        let single = evaluate(&model, vec![batch(1, 0)], &ProgressBar::hidden()).unwrap();
        let repeated = evaluate(&model, vec![batch(5, 0), batch(1, 0)], &ProgressBar::hidden()).unwrap();
        assert!((single.loss - repeated.loss).abs() < 1e-5);
    }

    #[test]
    fn test_requires_eval_mode() {
        let mut model = model();
        model.set_mode(Mode::Train);
        assert!(evaluate(&model, vec![batch(1, 0)], &ProgressBar::hidden()).is_err());
    }

    #[test]
    fn test_empty_set() {
        let model = model();
        let summary = evaluate(&model, Vec::<LabeledBatch<B>>::new(), &ProgressBar::hidden()).unwrap();
        assert_eq!(summary.num_examples, 0);
        assert_eq!(summary.top1, 0.0);
    }
}
