//! Run configuration
//!
//! Defaults follow the FixMatch paper setup for CIFAR. A config file (TOML,
//! or JSON by extension) may set any subset of fields; command-line flags
//! override it; the effective config is validated and then written next to
//! the checkpoints.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetKind, SplitBudget, StrongAugmentConfig, SyntheticConfig};
use crate::model::DEFAULT_HIDDEN_DIM;
use crate::training::{
    GroupedSgdConfig, StepConfig, DEFAULT_BATCH_SIZE, DEFAULT_EMA_DECAY, DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE,
    DEFAULT_NUM_CYCLES, DEFAULT_THRESHOLD,
};
use crate::utils::error::{FixMatchError, Result};

/// File the effective config is written to
pub const CONFIG_FILE: &str = "config.toml";

/// Everything a FixMatch run is parameterized by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixMatchConfig {
    pub dataset: DatasetKind,
    /// Root holding the CIFAR binary files
    pub data_dir: PathBuf,
    /// Labeled images, split evenly across classes
    pub num_labeled: usize,
    pub epochs: usize,
    /// Labeled batch size per process
    pub batch_size: usize,
    /// Unlabeled batch size per process; defaults to `batch_size`
    pub unlabeled_batch_size: Option<usize>,
    pub lr: f64,
    /// Warmup length in epochs (fractions allowed)
    pub warmup: f64,
    /// L2 coefficient; the decay group uses twice this value
    pub wdecay: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub use_ema: bool,
    pub ema_decay: f64,
    /// Unlabeled-to-labeled budget ratio
    pub mu: usize,
    /// Weight of the unsupervised loss
    pub lambda_u: f64,
    /// Pseudo-label confidence threshold
    pub threshold: f64,
    /// Labeled entries per epoch
    pub k_img: usize,
    /// Cosine cycles over the post-warmup schedule
    pub num_cycles: f64,
    /// Output directory for checkpoints and scalars
    pub out: PathBuf,
    /// Checkpoint to resume from
    pub resume: Option<PathBuf>,
    /// Seeds the split, loaders, augmentation and model init; drawn at
    /// random and logged when unset
    pub seed: Option<u64>,
    /// -1 for a single process
    pub local_rank: i64,
    pub no_progress: bool,
    pub hidden_dim: usize,
    pub strong: StrongAugmentConfig,
    pub synthetic: SyntheticConfig,
}

impl Default for FixMatchConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Cifar10,
            data_dir: PathBuf::from("data"),
            num_labeled: 4000,
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            unlabeled_batch_size: None,
            lr: DEFAULT_LEARNING_RATE,
            warmup: 0.0,
            wdecay: 5e-4,
            momentum: 0.9,
            nesterov: true,
            use_ema: true,
            ema_decay: DEFAULT_EMA_DECAY,
            mu: 7,
            lambda_u: 1.0,
            threshold: DEFAULT_THRESHOLD,
            k_img: 65536,
            num_cycles: DEFAULT_NUM_CYCLES,
            out: PathBuf::from("result"),
            resume: None,
            seed: None,
            local_rank: -1,
            no_progress: false,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            strong: StrongAugmentConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl FixMatchConfig {
    /// Small settings for smoke runs on the synthetic dataset
    pub fn smoke() -> Self {
        Self {
            dataset: DatasetKind::Synthetic,
            num_labeled: 40,
            epochs: 2,
            batch_size: 8,
            k_img: 64,
            mu: 2,
            hidden_dim: 32,
            ..Self::default()
        }
    }

    /// Load from a `.json` or `.toml` file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(FixMatchError::PathNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text).map_err(|e| FixMatchError::Config(e.to_string())),
            _ => Ok(toml::from_str(&text)?),
        }
    }

    /// Write as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FixMatchError::Config(msg));

        if self.epochs == 0 {
            return fail("epochs must be greater than 0".to_string());
        }
        if self.batch_size == 0 || self.unlabeled_batch_size == Some(0) {
            return fail("batch sizes must be greater than 0".to_string());
        }
        if self.k_img < self.batch_size {
            return fail(format!(
                "k_img ({}) must be at least batch_size ({})",
                self.k_img, self.batch_size
            ));
        }
        if self.mu == 0 {
            return fail("mu must be at least 1".to_string());
        }
        if !(self.lr > 0.0) {
            return fail(format!("lr must be positive, got {}", self.lr));
        }
        if self.warmup < 0.0 {
            return fail(format!("warmup must be non-negative, got {}", self.warmup));
        }
        if self.wdecay < 0.0 || self.lambda_u < 0.0 || self.threshold < 0.0 {
            return fail("wdecay, lambda_u and threshold must be non-negative".to_string());
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return fail(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if self.nesterov && self.momentum == 0.0 {
            return fail("nesterov requires a non-zero momentum".to_string());
        }
        if self.use_ema && !(self.ema_decay > 0.0 && self.ema_decay < 1.0) {
            return fail(format!("ema_decay must be in (0, 1), got {}", self.ema_decay));
        }
        if !(self.num_cycles > 0.0) {
            return fail(format!("num_cycles must be positive, got {}", self.num_cycles));
        }
        if self.local_rank < -1 {
            return fail(format!("local_rank must be -1 or a device index, got {}", self.local_rank));
        }
        if self.hidden_dim == 0 {
            return fail("hidden_dim must be greater than 0".to_string());
        }
        if self.num_labeled < self.dataset_classes() {
            return fail(format!(
                "num_labeled ({}) must cover every one of the {} classes",
                self.num_labeled,
                self.dataset_classes()
            ));
        }
        Ok(())
    }

    fn dataset_classes(&self) -> usize {
        match self.dataset {
            DatasetKind::Synthetic => self.synthetic.num_classes,
            other => other.num_classes(),
        }
    }

    /// Steps per epoch; the loaders cycle, so this alone bounds an epoch
    pub fn iterations_per_epoch(&self) -> usize {
        self.k_img / self.batch_size
    }

    pub fn total_steps(&self) -> u64 {
        (self.epochs * self.iterations_per_epoch()) as u64
    }

    pub fn unlabeled_batch(&self) -> usize {
        self.unlabeled_batch_size.unwrap_or(self.batch_size)
    }

    /// The configured seed, or a fresh random one when unset
    pub fn seed_or_random(&self) -> u64 {
        self.seed.unwrap_or_else(|| rand::thread_rng().gen())
    }

    pub fn split_budget(&self, seed: u64) -> SplitBudget {
        SplitBudget {
            num_labeled: self.num_labeled,
            labeled_expand: self.k_img,
            unlabeled_expand: self.k_img * self.mu,
            seed,
        }
    }

    /// Warmup in optimizer steps, kept fractional
    pub fn warmup_steps(&self, batches_per_pass: usize) -> f64 {
        self.warmup * batches_per_pass as f64
    }

    /// Optimizer settings; the decay group gets `2 * wdecay`
    pub fn sgd(&self) -> GroupedSgdConfig {
        GroupedSgdConfig {
            momentum: self.momentum,
            nesterov: self.nesterov,
            weight_decay: self.wdecay * 2.0,
            ..GroupedSgdConfig::default()
        }
    }

    pub fn step(&self) -> StepConfig {
        StepConfig {
            base_lr: self.lr,
            lambda_u: self.lambda_u,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_paper_setup() {
        let config = FixMatchConfig::default();
        assert_eq!(config.epochs, 1024);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.iterations_per_epoch(), 1024);
        assert_eq!(config.total_steps(), 1024 * 1024);
        assert_eq!(config.unlabeled_batch(), 64);
        assert_eq!(config.split_budget(0).unlabeled_expand, 65536 * 7);
        assert!((config.sgd().weight_decay - 1e-3).abs() < 1e-12);
        assert!((config.num_cycles - 7.0 / 16.0).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn test_unset_seed_is_drawn_at_random() {
        let fixed = FixMatchConfig {
            seed: Some(11),
            ..FixMatchConfig::default()
        };
        assert_eq!(fixed.seed_or_random(), 11);
        assert_eq!(fixed.split_budget(fixed.seed_or_random()).seed, 11);

        let unset = FixMatchConfig::default();
        assert_eq!(unset.seed, None);
        assert_ne!(unset.seed_or_random(), unset.seed_or_random());
    }

    #[test]
    fn test_fractional_warmup_steps() {
        let config = FixMatchConfig {
            warmup: 0.5,
            ..FixMatchConfig::default()
        };
        assert_eq!(config.warmup_steps(3), 1.5);
        assert_eq!(config.warmup_steps(0), 0.0);
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config: FixMatchConfig = toml::from_str(
            r#"
            dataset = "cifar100"
            num_labeled = 10000
            threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.dataset, DatasetKind::Cifar100);
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.mu, 7);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FixMatchConfig::smoke();
        config.seed = Some(5);
        config.resume = Some(PathBuf::from("result/checkpoint.bin"));

        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();
        assert_eq!(FixMatchConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"epochs": 3, "dataset": "synthetic"}"#).unwrap();
        let config = FixMatchConfig::load(&path).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.dataset, DatasetKind::Synthetic);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            FixMatchConfig {
                batch_size: 0,
                ..FixMatchConfig::default()
            },
            FixMatchConfig {
                k_img: 10,
                ..FixMatchConfig::default()
            },
            FixMatchConfig {
                ema_decay: 1.0,
                ..FixMatchConfig::default()
            },
            FixMatchConfig {
                num_labeled: 5,
                ..FixMatchConfig::default()
            },
            FixMatchConfig {
                local_rank: -2,
                ..FixMatchConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err());
        }
        // EMA decay is irrelevant when EMA is off
        FixMatchConfig {
            use_ema: false,
            ema_decay: 1.0,
            ..FixMatchConfig::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            FixMatchConfig::load(Path::new("/nonexistent/run.toml")),
            Err(FixMatchError::PathNotFound(_))
        ));
    }
}
