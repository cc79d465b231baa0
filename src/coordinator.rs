//! Run coordinator
//!
//! Drives one FixMatch run on every rank:
//!
//! 1. Rank 0 creates the output directory and the scalar log; the other
//!    ranks wait for it
//! 2. Data and model are built rank 0 first, then everyone else, then all
//!    ranks wait for each other
//! 3. A checkpoint, if given, is restored before the model is wrapped for
//!    replication, since wrapping changes parameter naming
//! 4. Each epoch: train, evaluate (EMA shadow if enabled), and on rank 0
//!    only log scalars and write the checkpoint
//!
//! The best accuracy is run state, carried through the loop and persisted
//! in every checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{load_checkpoint, save_checkpoint, RunState};
use crate::config::{FixMatchConfig, CONFIG_FILE};
use crate::dataset::{
    build_data, Augmenter, FixMatchBatcher, FixMatchData, LabeledLoader, ShardedSampler, TestLoader,
    UnlabeledLoader,
};
use crate::distributed::{rank_zero_first, ProcessGroup, Replicated};
use crate::model::{Classifier, MlpClassifier, MlpClassifierConfig, TrainableModel};
use crate::training::{
    CosineWarmupSchedule, EvalSummary, FixMatchTrainer, GroupedSgd, ModelEma, PseudoLabelConfig, PseudoLabeler,
    StepConfig, TrainSummary,
};
use crate::utils::error::{FixMatchError, Result};
use crate::utils::metrics::median;
use crate::utils::scalars::{CsvScalarWriter, ScalarSink};
use crate::utils::{format_number, progress_bar};

/// Epochs the reported median accuracy covers
pub const MEDIAN_WINDOW: usize = 20;

/// Best and recent test accuracies
#[derive(Debug, Clone, Default)]
pub struct AccuracyTracker {
    best: f64,
    history: Vec<f64>,
}

impl AccuracyTracker {
    /// Start from a best accuracy restored from a checkpoint
    pub fn new(best: f64) -> Self {
        Self {
            best,
            history: Vec::new(),
        }
    }

    /// Record an epoch's accuracy; true when it beats every earlier one
    pub fn record(&mut self, acc: f64) -> bool {
        let is_best = acc > self.best;
        self.best = self.best.max(acc);
        self.history.push(acc);
        is_best
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Median over the last [`MEDIAN_WINDOW`] epochs of this process
    pub fn median_recent(&self) -> f64 {
        let start = self.history.len().saturating_sub(MEDIAN_WINDOW);
        median(&self.history[start..])
    }
}

/// One finished epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: TrainSummary,
    pub test: EvalSummary,
    pub best_acc: f64,
}

/// Outcome of [`run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub start_epoch: usize,
    pub epochs: Vec<EpochRecord>,
    pub best_acc: f64,
    pub median_acc: f64,
    /// Where checkpoints went
    pub out_dir: PathBuf,
}

/// Everything the epoch loop needs besides the trainer
struct EpochLoop<B: AutodiffBackend> {
    labeled: LabeledLoader<B>,
    unlabeled: UnlabeledLoader<B>,
    test: TestLoader<B::InnerBackend>,
    sink: Option<CsvScalarWriter>,
    tracker: AccuracyTracker,
    start_epoch: usize,
    out_dir: PathBuf,
    started_at: DateTime<Utc>,
}

/// Checkpoint directory: the resumed checkpoint's own, else `config.out`
fn output_dir(config: &FixMatchConfig) -> PathBuf {
    match config.resume.as_deref().and_then(Path::parent) {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => config.out.clone(),
    }
}

/// Run seed shared by every rank: the configured one, else rank 0's random
/// draw. The draw travels as four 16-bit parts, each exact in an `f32`.
pub fn agree_seed(config: &FixMatchConfig, group: &dyn ProcessGroup) -> Result<u64> {
    if let Some(seed) = config.seed {
        return Ok(seed);
    }

    let drawn = if group.is_main() { config.seed_or_random() } else { 0 };
    let mut parts: Vec<f32> = (0..4).map(|i| ((drawn >> (16 * i)) & 0xFFFF) as f32).collect();
    group.broadcast_from_main(&mut parts)?;
    if parts.len() != 4 {
        return Err(FixMatchError::Distributed(format!(
            "Seed broadcast carried {} parts, expected 4",
            parts.len()
        )));
    }
    let seed = parts
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &part)| acc | ((part as u64) << (16 * i)));
    info!("No seed configured, using random seed {}", seed);
    Ok(seed)
}

/// Model, optimizer, schedule and EMA for one run, before replication
pub struct TrainerParts<B: AutodiffBackend> {
    pub model: MlpClassifier<B>,
    pub optimizer: GroupedSgd<B, MlpClassifier<B>>,
    pub schedule: CosineWarmupSchedule,
    pub ema: Option<ModelEma<B, MlpClassifier<B::InnerBackend>>>,
    /// Next epoch to run
    pub start_epoch: usize,
    pub best_acc: f64,
}

impl<B: AutodiffBackend> TrainerParts<B> {
    /// Fresh parts at epoch 0, with `warmup_steps` optimizer steps of warmup
    pub fn build(
        config: &FixMatchConfig,
        seed: u64,
        data: &FixMatchData,
        warmup_steps: f64,
        device: &B::Device,
    ) -> Result<Self> {
        let model = MlpClassifierConfig::new(data.shape().numel(), data.num_classes())
            .with_hidden_dim(config.hidden_dim)
            .with_seed(seed)
            .init::<B>(device);
        let optimizer = GroupedSgd::new(config.sgd(), &model.param_ids())?;
        let schedule = CosineWarmupSchedule::new(warmup_steps, config.total_steps(), config.num_cycles);
        let ema = if config.use_ema {
            Some(ModelEma::new(&model, config.ema_decay)?)
        } else {
            None
        };

        Ok(Self {
            model,
            optimizer,
            schedule,
            ema,
            start_epoch: 0,
            best_acc: 0.0,
        })
    }

    /// Load every piece of `state`. Must run before the model is wrapped,
    /// since wrapping changes parameter naming.
    pub fn restore(self, state: &RunState, device: &B::Device) -> Result<Self> {
        let Self {
            mut model,
            optimizer,
            mut schedule,
            mut ema,
            ..
        } = self;

        model.load_state_dict(&state.state_dict)?;
        match (ema.as_mut(), &state.ema_state_dict) {
            (Some(ema), Some(dict)) => ema.load_state_dict(dict)?,
            (Some(_), None) => {
                return Err(FixMatchError::Config(
                    "EMA is enabled but the checkpoint has no EMA weights".to_string(),
                ))
            }
            (None, _) => {}
        }
        let optimizer = optimizer.load_state(&state.optimizer, device)?;
        schedule.load_state(state.scheduler);

        Ok(Self {
            model,
            optimizer,
            schedule,
            ema,
            start_epoch: state.epoch,
            best_acc: state.best_acc,
        })
    }

    /// Assemble a trainer around `wrap(model)`
    pub fn into_trainer<M, F>(self, wrap: F, labeler: PseudoLabeler, step: StepConfig) -> Result<FixMatchTrainer<B, M>>
    where
        M: TrainableModel<B, Module = MlpClassifier<B>, Valid = MlpClassifier<B::InnerBackend>>,
        F: FnOnce(MlpClassifier<B>) -> Result<M>,
    {
        let model = wrap(self.model)?;
        Ok(FixMatchTrainer::new(model, self.optimizer, self.schedule, self.ema, labeler, step))
    }
}

/// Run FixMatch training on this rank
pub fn run<B: AutodiffBackend>(
    config: &FixMatchConfig,
    group: Arc<dyn ProcessGroup>,
    device: B::Device,
) -> Result<RunReport> {
    config.validate()?;
    let started_at = Utc::now();
    let rank = group.rank();
    let world_size = group.world_size();
    let seed = agree_seed(config, group.as_ref())?;
    // The saved config records the seed actually used
    let config = &FixMatchConfig {
        seed: Some(seed),
        ..config.clone()
    };
    let out_dir = output_dir(config);

    let sink = rank_zero_first(group.as_ref(), || {
        if !group.is_main() {
            return Ok(None);
        }
        std::fs::create_dir_all(&out_dir)?;
        config.save(&out_dir.join(CONFIG_FILE))?;
        CsvScalarWriter::create(&out_dir).map(Some)
    })?;
    debug!("Effective config: {:?}", config);

    let data = rank_zero_first(group.as_ref(), || {
        build_data(
            config.dataset,
            &config.data_dir,
            &config.split_budget(seed),
            &config.synthetic,
        )
    })?;

    let batcher = FixMatchBatcher::new(data.shape(), data.normalization.clone());
    let augmenter = Augmenter::new(data.shape(), config.strong.clone());
    let aug_seed = seed.wrapping_add(1_000 * (rank as u64 + 1));

    let labeled = LabeledLoader::<B>::new(
        data.train.clone(),
        ShardedSampler::new(
            data.labeled_indices.clone(),
            config.batch_size,
            rank,
            world_size,
            true,
            seed.wrapping_add(1),
        )?,
        augmenter.clone(),
        batcher.clone(),
        aug_seed,
        device.clone(),
    );
    let unlabeled = UnlabeledLoader::<B>::new(
        data.train.clone(),
        ShardedSampler::new(
            data.unlabeled_indices.clone(),
            config.unlabeled_batch(),
            rank,
            world_size,
            true,
            seed.wrapping_add(2),
        )?,
        augmenter,
        batcher.clone(),
        aug_seed.wrapping_add(1),
        device.clone(),
    );
    let test = TestLoader::<B::InnerBackend>::new(data.test.clone(), config.batch_size, batcher, device.clone());

    let warmup_steps = config.warmup_steps(unlabeled.batches_per_pass());
    let mut parts = rank_zero_first(group.as_ref(), || {
        TrainerParts::<B>::build(config, seed, &data, warmup_steps, &device)
    })?;
    if let Some(path) = &config.resume {
        let state = rank_zero_first(group.as_ref(), || {
            info!("==> Resuming from checkpoint {:?}", path);
            load_checkpoint(path)
        })?;
        parts = parts.restore(&state, &device)?;
    }

    info!("***** Running training ({}) *****", started_at.format("%Y-%m-%d %H:%M:%S"));
    info!("  Task = {}@{}", config.dataset, config.num_labeled);
    info!("  Num Epochs = {}", config.epochs);
    info!("  Batch size per process = {}", config.batch_size);
    info!("  Total train batch size = {}", config.batch_size * world_size);
    info!("  Total optimization steps = {}", format_number(config.total_steps() as usize));
    info!("  {}", parts.schedule.description());

    let epoch_parts = EpochLoop {
        labeled,
        unlabeled,
        test,
        sink,
        tracker: AccuracyTracker::new(parts.best_acc),
        start_epoch: parts.start_epoch,
        out_dir,
        started_at,
    };
    let labeler = PseudoLabeler::new(PseudoLabelConfig {
        threshold: config.threshold,
    });

    if config.local_rank != -1 {
        let trainer = parts.into_trainer(
            |model| Replicated::new::<B>(model, group.clone()),
            labeler,
            config.step(),
        )?;
        epoch_loop(trainer, epoch_parts, config, group.as_ref())
    } else {
        let trainer = parts.into_trainer(Ok, labeler, config.step())?;
        epoch_loop(trainer, epoch_parts, config, group.as_ref())
    }
}

fn epoch_loop<B, M>(
    mut trainer: FixMatchTrainer<B, M>,
    mut parts: EpochLoop<B>,
    config: &FixMatchConfig,
    group: &dyn ProcessGroup,
) -> Result<RunReport>
where
    B: AutodiffBackend,
    M: TrainableModel<B>,
{
    let iterations = config.iterations_per_epoch();
    let show_progress = group.is_main() && !config.no_progress;
    let mut epochs = Vec::new();

    for epoch in parts.start_epoch..config.epochs {
        let pb = progress_bar(
            iterations as u64,
            &format!("Train {:4}/{:4}", epoch + 1, config.epochs),
            show_progress,
        );
        let train = trainer.train_epoch(&mut parts.labeled, &mut parts.unlabeled, iterations, &pb)?;

        if config.no_progress {
            info!(
                "Epoch {}. train_loss: {:.4}. train_loss_x: {:.4}. train_loss_u: {:.4}.",
                epoch + 1,
                train.loss,
                train.loss_x,
                train.loss_u
            );
        }

        let pb = progress_bar(parts.test.num_batches() as u64, "Test", show_progress);
        let test = trainer.evaluate(&parts.test, &pb)?;
        info!(
            "Epoch {}. test_loss: {:.4}. top1: {:.2}. top5: {:.2}.",
            epoch + 1,
            test.loss,
            test.top1,
            test.top5
        );

        let is_best = parts.tracker.record(test.top1);

        if group.is_main() {
            if let Some(sink) = parts.sink.as_mut() {
                sink.add_scalar("train_loss", train.loss, epoch)?;
                sink.add_scalar("train_loss_x", train.loss_x, epoch)?;
                sink.add_scalar("train_loss_u", train.loss_u, epoch)?;
                sink.add_scalar("mask_rate", train.mask_rate, epoch)?;
                sink.add_scalar("test_accuracy", test.top1, epoch)?;
                sink.add_scalar("test_loss", test.loss, epoch)?;
            }
            let state = RunState::from_snapshot(trainer.snapshot()?, epoch + 1, test.top1, parts.tracker.best());
            save_checkpoint(&state, is_best, &parts.out_dir)?;
        }

        info!("Best top-1 acc: {:.2}", parts.tracker.best());
        info!("Median top-1 acc: {:.2}", parts.tracker.median_recent());

        epochs.push(EpochRecord {
            epoch,
            train,
            test,
            best_acc: parts.tracker.best(),
        });
    }

    if let Some(sink) = parts.sink.as_mut() {
        sink.close()?;
    }

    Ok(RunReport {
        started_at: parts.started_at,
        start_epoch: parts.start_epoch,
        epochs,
        best_acc: parts.tracker.best(),
        median_acc: parts.tracker.median_recent(),
        out_dir: parts.out_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{launch_local, SingleProcess};

    #[test]
    fn test_best_accuracy_is_running_max() {
        let mut tracker = AccuracyTracker::new(0.0);
        let bests: Vec<(bool, f64)> = [70.0, 65.0, 80.0, 75.0]
            .iter()
            .map(|&acc| (tracker.record(acc), tracker.best()))
            .collect();
        assert_eq!(
            bests,
            vec![(true, 70.0), (false, 70.0), (true, 80.0), (false, 80.0)]
        );
    }

    #[test]
    fn test_restored_best_must_be_beaten() {
        let mut tracker = AccuracyTracker::new(90.0);
        assert!(!tracker.record(85.0));
        assert!(!tracker.record(90.0));
        assert_eq!(tracker.best(), 90.0);
    }

    #[test]
    fn test_median_covers_recent_window() {
        let mut tracker = AccuracyTracker::new(0.0);
        for acc in 0..30 {
            tracker.record(acc as f64);
        }
        // Last 20 are 10..=29
        assert_eq!(tracker.median_recent(), 19.5);
    }

    #[test]
    fn test_configured_seed_is_kept() {
        let config = FixMatchConfig {
            seed: Some(42),
            ..FixMatchConfig::default()
        };
        assert_eq!(agree_seed(&config, &SingleProcess).unwrap(), 42);
    }

    #[test]
    fn test_random_seed_is_shared_by_all_ranks() {
        let config = FixMatchConfig::default();
        assert_eq!(config.seed, None);

        let seeds = launch_local(3, |group| agree_seed(&config, &group).unwrap()).unwrap();
        assert_eq!(seeds[0], seeds[1]);
        assert_eq!(seeds[0], seeds[2]);

        // Two independent draws colliding is a 2^-64 event
        let other = launch_local(2, |group| agree_seed(&config, &group).unwrap()).unwrap();
        assert_ne!(seeds[0], other[0]);
    }

    #[test]
    fn test_output_dir_follows_resume() {
        let mut config = FixMatchConfig::default();
        assert_eq!(output_dir(&config), PathBuf::from("result"));
        config.resume = Some(PathBuf::from("runs/a/checkpoint.bin"));
        assert_eq!(output_dir(&config), PathBuf::from("runs/a"));
        config.resume = Some(PathBuf::from("checkpoint.bin"));
        assert_eq!(output_dir(&config), PathBuf::from("."));
    }
}
