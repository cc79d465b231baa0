//! Training module for FixMatch semi-supervised learning
//!
//! This module provides:
//! - The FixMatch training step and epoch loop
//! - Confidence-gated pseudo-labeling
//! - The EMA shadow model used for evaluation
//! - SGD with Nesterov momentum and a weight-decay parameter split
//! - Warmup + cosine learning-rate scheduling
//! - Held-out evaluation
//!
//! ## Semi-Supervised Learning Approach
//!
//! Each step trains on a labeled batch with cross entropy and on an
//! unlabeled batch by consistency: the weakly augmented view proposes a
//! label, the strongly augmented view is trained against it when the
//! proposal is confident enough.

pub mod ema;
pub mod evaluate;
pub mod loss;
pub mod optimizer;
pub mod pseudo_label;
pub mod scheduler;
pub mod trainer;

// Re-export main types for convenience
pub use ema::ModelEma;
pub use evaluate::{evaluate, EvalSummary};
pub use optimizer::{GroupedSgd, GroupedSgdConfig, OptimizerState, ParamGroup};
pub use pseudo_label::{PseudoLabelConfig, PseudoLabeler, PseudoLabels};
pub use scheduler::{CosineWarmupSchedule, ScheduleState, DEFAULT_NUM_CYCLES};
pub use trainer::{FixMatchTrainer, StepConfig, StepOutput, TrainSummary, TrainerSnapshot};

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 1024;

/// Default labeled batch size
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default base learning rate
pub const DEFAULT_LEARNING_RATE: f64 = 0.03;

/// Default confidence threshold for pseudo-labeling
pub const DEFAULT_THRESHOLD: f64 = 0.95;

/// Default EMA decay
pub const DEFAULT_EMA_DECAY: f64 = 0.999;
