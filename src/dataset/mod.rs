//! Dataset module for FixMatch data handling
//!
//! This module provides functionality for:
//! - Loading CIFAR-10 / CIFAR-100 from their binary distributions
//! - A synthetic Gaussian-blob dataset for smoke runs and tests
//! - The labeled/unlabeled index split expanded to the per-epoch budgets
//! - Weak and strong augmentation
//! - Cycling, rank-sharded loaders yielding device batches
//!
//! ## Split Strategy
//!
//! 1. **Labeled**: `num_labeled / num_classes` images per class, repeated to
//!    fill `k_img` entries
//! 2. **Unlabeled**: every training image, repeated to fill `k_img * mu`
//!    entries; its labels are never read by the training step
//! 3. **Test**: the held-out split, evaluated once per epoch

pub mod augmentation;
pub mod batcher;
pub mod cifar;
pub mod loader;
pub mod split;
pub mod synthetic;

use std::path::Path;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{FixMatchError, Result};

// Re-export main types for convenience
pub use augmentation::{Augmenter, StrongAugmentConfig};
pub use batcher::{FixMatchBatcher, LabeledBatch, UnlabeledBatch};
pub use cifar::{load_cifar10, load_cifar100};
pub use loader::{LabeledLoader, ShardedSampler, TestLoader, UnlabeledLoader};
pub use split::{expand_indices, labeled_unlabeled_split};
pub use synthetic::SyntheticConfig;

/// CIFAR-10 per-channel mean
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// CIFAR-10 per-channel standard deviation
pub const CIFAR10_STD: [f32; 3] = [0.2471, 0.2435, 0.2616];
/// CIFAR-100 per-channel mean
pub const CIFAR100_MEAN: [f32; 3] = [0.5071, 0.4867, 0.4408];
/// CIFAR-100 per-channel standard deviation
pub const CIFAR100_STD: [f32; 3] = [0.2675, 0.2565, 0.2761];

/// Which dataset a run trains on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cifar10,
    Cifar100,
    Synthetic,
}

impl DatasetKind {
    pub fn num_classes(&self) -> usize {
        match self {
            DatasetKind::Cifar10 | DatasetKind::Synthetic => 10,
            DatasetKind::Cifar100 => 100,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cifar10" => Ok(DatasetKind::Cifar10),
            "cifar100" => Ok(DatasetKind::Cifar100),
            "synthetic" => Ok(DatasetKind::Synthetic),
            other => Err(FixMatchError::Config(format!("Unknown dataset '{}'", other))),
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::Cifar10 => write!(f, "cifar10"),
            DatasetKind::Cifar100 => write!(f, "cifar100"),
            DatasetKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Image geometry, channels-first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// One image with values in `[0, 1]`, laid out `[channels, height, width]`
#[derive(Debug, Clone, PartialEq)]
pub struct ImageItem {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// In-memory image collection
#[derive(Debug, Clone)]
pub struct ImageDataset {
    items: Vec<ImageItem>,
    shape: ImageShape,
    num_classes: usize,
}

impl ImageDataset {
    pub fn new(items: Vec<ImageItem>, shape: ImageShape, num_classes: usize) -> Result<Self> {
        if let Some(bad) = items.iter().find(|i| i.pixels.len() != shape.numel()) {
            return Err(FixMatchError::Dataset(format!(
                "Image has {} values, expected {}",
                bad.pixels.len(),
                shape.numel()
            )));
        }
        if let Some(bad) = items.iter().find(|i| i.label >= num_classes) {
            return Err(FixMatchError::Dataset(format!(
                "Label {} out of range for {} classes",
                bad.label, num_classes
            )));
        }
        Ok(Self {
            items,
            shape,
            num_classes,
        })
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn labels(&self) -> Vec<usize> {
        self.items.iter().map(|i| i.label).collect()
    }

    pub fn item(&self, index: usize) -> Option<&ImageItem> {
        self.items.get(index)
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Per-channel normalization applied after augmentation
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    pub fn new(mean: &[f32], std: &[f32]) -> Self {
        Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
        }
    }
}

/// Everything a FixMatch run reads
#[derive(Debug, Clone)]
pub struct FixMatchData {
    pub train: Arc<ImageDataset>,
    pub test: Arc<ImageDataset>,
    /// Indices into `train`, already expanded to `k_img`
    pub labeled_indices: Vec<usize>,
    /// Indices into `train`, already expanded to `k_img * mu`
    pub unlabeled_indices: Vec<usize>,
    pub normalization: Normalization,
}

impl FixMatchData {
    pub fn num_classes(&self) -> usize {
        self.train.num_classes()
    }

    pub fn shape(&self) -> ImageShape {
        self.train.shape()
    }
}

/// Budgets for building [`FixMatchData`]
#[derive(Debug, Clone)]
pub struct SplitBudget {
    pub num_labeled: usize,
    pub labeled_expand: usize,
    pub unlabeled_expand: usize,
    pub seed: u64,
}

/// Load the train/test splits for `kind` and build the labeled/unlabeled
/// index lists.
pub fn build_data(
    kind: DatasetKind,
    root: &Path,
    budget: &SplitBudget,
    synthetic: &SyntheticConfig,
) -> Result<FixMatchData> {
    let (train, test, normalization) = match kind {
        DatasetKind::Cifar10 => {
            let (train, test) = load_cifar10(root)?;
            (train, test, Normalization::new(&CIFAR10_MEAN, &CIFAR10_STD))
        }
        DatasetKind::Cifar100 => {
            let (train, test) = load_cifar100(root)?;
            (train, test, Normalization::new(&CIFAR100_MEAN, &CIFAR100_STD))
        }
        DatasetKind::Synthetic => {
            let (train, test) = synthetic.generate()?;
            let channels = synthetic.channels;
            (
                train,
                test,
                Normalization::new(&vec![0.5; channels], &vec![0.25; channels]),
            )
        }
    };

    let (labeled_indices, unlabeled_indices) = labeled_unlabeled_split(
        &train.labels(),
        train.num_classes(),
        budget.num_labeled,
        budget.labeled_expand,
        budget.unlabeled_expand,
        budget.seed,
    )?;

    info!(
        "Dataset {}: {} train / {} test images, {} labeled entries, {} unlabeled entries",
        kind,
        train.len(),
        test.len(),
        labeled_indices.len(),
        unlabeled_indices.len()
    );

    Ok(FixMatchData {
        train: Arc::new(train),
        test: Arc::new(test),
        labeled_indices,
        unlabeled_indices,
        normalization,
    })
}
