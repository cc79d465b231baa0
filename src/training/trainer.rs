//! FixMatch training step and epoch loop
//!
//! One step consumes a labeled batch and an unlabeled (weak, strong) pair:
//!
//! 1. Concatenate labeled, weak and strong images and run a single forward
//!    pass so normalization sees one statistic across all three
//! 2. Split the logits back by the known batch sizes
//! 3. `Lx` = cross entropy of the labeled logits against the true labels
//! 4. Pseudo-label the weak logits (detached), `Lu` = masked cross entropy
//!    of the strong logits against them
//! 5. Backward on `Lx + lambda_u * Lu`, SGD step at the scheduled rate,
//!    advance the schedule, update the EMA shadow from the new weights

use burn::tensor::{backend::AutodiffBackend, ElementConversion, Tensor};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ema::ModelEma;
use super::evaluate::{evaluate, EvalSummary};
use super::loss::cross_entropy;
use super::optimizer::{GroupedSgd, OptimizerState};
use super::pseudo_label::PseudoLabeler;
use super::scheduler::{CosineWarmupSchedule, ScheduleState};
use crate::dataset::{LabeledBatch, TestLoader, UnlabeledBatch};
use crate::model::{Classifier, Mode, StateDict, TrainableModel};
use crate::utils::error::Result;
use crate::utils::metrics::AverageMeter;

/// Fixed scalars of the training step
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepConfig {
    /// Learning rate before the schedule multiplier
    pub base_lr: f64,
    /// Weight of the unsupervised loss
    pub lambda_u: f64,
}

/// Scalars read back from one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub loss_x: f64,
    pub loss_u: f64,
    pub mask_rate: f64,
    /// Learning rate the step was taken at
    pub lr: f64,
}

/// Per-epoch training report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Running mean of the total loss
    pub loss: f64,
    pub loss_x: f64,
    pub loss_u: f64,
    /// Mask rate of the last step
    pub mask_rate: f64,
    pub steps: usize,
}

/// Weights, shadow, optimizer and schedule, host-side
#[derive(Debug, Clone)]
pub struct TrainerSnapshot {
    pub state_dict: StateDict,
    pub ema_state_dict: Option<StateDict>,
    pub optimizer: OptimizerState,
    pub scheduler: ScheduleState,
}

/// Owns everything one FixMatch step mutates
pub struct FixMatchTrainer<B, M>
where
    B: AutodiffBackend,
    M: TrainableModel<B>,
{
    model: M,
    optimizer: GroupedSgd<B, M::Module>,
    schedule: CosineWarmupSchedule,
    ema: Option<ModelEma<B, M::Valid>>,
    labeler: PseudoLabeler,
    config: StepConfig,
}

impl<B, M> FixMatchTrainer<B, M>
where
    B: AutodiffBackend,
    M: TrainableModel<B>,
{
    pub fn new(
        model: M,
        optimizer: GroupedSgd<B, M::Module>,
        schedule: CosineWarmupSchedule,
        ema: Option<ModelEma<B, M::Valid>>,
        labeler: PseudoLabeler,
        config: StepConfig,
    ) -> Self {
        Self {
            model,
            optimizer,
            schedule,
            ema,
            labeler,
            config,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn ema(&self) -> Option<&ModelEma<B, M::Valid>> {
        self.ema.as_ref()
    }

    pub fn schedule(&self) -> &CosineWarmupSchedule {
        &self.schedule
    }

    pub fn optimizer(&self) -> &GroupedSgd<B, M::Module> {
        &self.optimizer
    }

    /// One FixMatch step
    pub fn train_step(&mut self, labeled: LabeledBatch<B>, unlabeled: UnlabeledBatch<B>) -> Result<StepOutput> {
        let batch_x = labeled.images.dims()[0];
        let batch_u = unlabeled.weak.dims()[0];

        let inputs = Tensor::cat(vec![labeled.images, unlabeled.weak, unlabeled.strong], 0);
        let logits = self.model.forward(inputs);

        let logits_x = logits.clone().narrow(0, 0, batch_x);
        let logits_weak = logits.clone().narrow(0, batch_x, batch_u);
        let logits_strong = logits.narrow(0, batch_x + batch_u, batch_u);

        let loss_x = cross_entropy(logits_x, labeled.targets);
        let pseudo = self.labeler.generate(logits_weak);
        let loss_u = self.labeler.unsupervised_loss(logits_strong, &pseudo);
        let loss = loss_x.clone() + loss_u.clone().mul_scalar(self.config.lambda_u);

        let loss_value: f64 = loss.clone().into_scalar().elem();
        let loss_x_value: f64 = loss_x.into_scalar().elem();
        let loss_u_value: f64 = loss_u.into_scalar().elem();
        let mask_rate: f64 = pseudo.mask_rate().into_scalar().elem();

        let grads = self.model.backward(loss)?;

        let lr = self.schedule.lr(self.config.base_lr);
        let optimizer = &mut self.optimizer;
        self.model.update(|module| Ok(optimizer.step(lr, module, grads)))?;
        self.schedule.step();

        if let Some(ema) = self.ema.as_mut() {
            ema.update(&self.model)?;
        }

        Ok(StepOutput {
            loss: loss_value,
            loss_x: loss_x_value,
            loss_u: loss_u_value,
            mask_rate,
            lr,
        })
    }

    /// Run exactly `iterations` steps, pairing batches from both iterators.
    ///
    /// An iterator that ends early cuts the epoch short with a warning.
    pub fn train_epoch<L, U>(
        &mut self,
        labeled: &mut L,
        unlabeled: &mut U,
        iterations: usize,
        progress: &ProgressBar,
    ) -> Result<TrainSummary>
    where
        L: Iterator<Item = LabeledBatch<B>>,
        U: Iterator<Item = UnlabeledBatch<B>>,
    {
        self.model.set_mode(Mode::Train);

        let mut losses = AverageMeter::new();
        let mut losses_x = AverageMeter::new();
        let mut losses_u = AverageMeter::new();
        let mut mask_rate = 0.0;
        let mut steps = 0;

        for iteration in 0..iterations {
            let (Some(x), Some(u)) = (labeled.next(), unlabeled.next()) else {
                warn!(
                    "Loader exhausted after {} of {} iterations",
                    iteration, iterations
                );
                break;
            };

            let out = self.train_step(x, u)?;
            losses.update(out.loss, 1);
            losses_x.update(out.loss_x, 1);
            losses_u.update(out.loss_u, 1);
            mask_rate = out.mask_rate;
            steps += 1;

            progress.inc(1);
            progress.set_message(format!(
                "lr {:.4} loss {:.4} Lx {:.4} Lu {:.4} mask {:.2}",
                out.lr, losses.avg, losses_x.avg, losses_u.avg, mask_rate
            ));
        }
        progress.finish_and_clear();

        debug!(
            "Epoch done: {} steps, schedule at step {}",
            steps,
            self.schedule.current_step()
        );

        Ok(TrainSummary {
            loss: losses.avg,
            loss_x: losses_x.avg,
            loss_u: losses_u.avg,
            mask_rate,
            steps,
        })
    }

    /// Evaluate the EMA shadow when there is one, else an eval copy of the
    /// live weights
    pub fn evaluate(&self, test: &TestLoader<B::InnerBackend>, progress: &ProgressBar) -> Result<EvalSummary> {
        match &self.ema {
            Some(ema) => evaluate(ema.model(), test.iter(), progress),
            None => evaluate(&self.model.eval_copy(), test.iter(), progress),
        }
    }

    /// Host copy of all resumable state, parameters under plain names
    pub fn snapshot(&self) -> Result<TrainerSnapshot> {
        Ok(TrainerSnapshot {
            state_dict: self.model.state_dict()?,
            ema_state_dict: self.ema.as_ref().map(|ema| ema.state_dict()).transpose()?,
            optimizer: self.optimizer.state()?,
            scheduler: self.schedule.state(),
        })
    }

    pub fn into_model(self) -> M {
        self.model
    }
}
