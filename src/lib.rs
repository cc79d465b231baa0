//! # FixMatch Semi-Supervised Learning
//!
//! A Rust library for semi-supervised image classification with FixMatch,
//! built on the Burn framework.
//!
//! ## Features
//!
//! - **FixMatch training step**: weak/strong consistency with confidence-masked
//!   pseudo-labels and a single joint forward pass
//! - **Cosine schedule with linear warmup**, SGD with Nesterov momentum and a
//!   decay/no-decay parameter split
//! - **EMA shadow model** used for evaluation
//! - **Data-parallel runs** across threads or processes with gradient averaging
//! - **Resumable checkpoints** carrying weights, optimizer and schedule state
//!
//! ## Modules
//!
//! - `dataset`: CIFAR and synthetic data, the labeled/unlabeled split,
//!   augmentation and sharded loaders
//! - `model`: Named parameters and the classifier contracts
//! - `training`: Schedule, optimizer, EMA, pseudo-labeling, step and evaluation
//! - `distributed`: Process groups, launch context and model replication
//! - `checkpoint`: Run state persistence
//! - `coordinator`: The per-rank run loop
//! - `utils`: Logging, metrics, scalar logs and helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fixmatch_ssl::backend::TrainingBackend;
//! use fixmatch_ssl::distributed::SingleProcess;
//! use fixmatch_ssl::FixMatchConfig;
//!
//! let config = FixMatchConfig::smoke();
//! let report = fixmatch_ssl::run::<TrainingBackend>(&config, Arc::new(SingleProcess), Default::default())?;
//! println!("best top-1: {:.2}", report.best_acc);
//! ```

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod distributed;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use checkpoint::{load_checkpoint, save_checkpoint, RunState};
pub use config::FixMatchConfig;
pub use coordinator::{run, AccuracyTracker, RunReport, TrainerParts};
pub use dataset::{DatasetKind, FixMatchData};
pub use distributed::{LaunchContext, ProcessGroup, Replicated};
pub use model::{Classifier, MlpClassifier, MlpClassifierConfig, TrainableModel};
pub use training::{CosineWarmupSchedule, FixMatchTrainer, GroupedSgd, ModelEma, PseudoLabeler};
pub use utils::error::{FixMatchError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
