//! Model module
//!
//! This module provides:
//! - Named parameter storage, state dicts and the wrapper naming rule
//! - The `Classifier` / `TrainableModel` contracts the training loop consumes
//! - A reference MLP classifier

pub mod classifier;
pub mod mlp;
pub mod params;

// Re-export main types for convenience
pub use classifier::{Classifier, Mode, TrainableModel};
pub use mlp::{MlpClassifier, MlpClassifierConfig};
pub use params::{
    assign_params, collect_params, FlatParam, Naming, ParamValues, StateDict, TensorRecord, WRAPPER_PREFIX,
};

/// Default hidden width of the reference classifier
pub const DEFAULT_HIDDEN_DIM: usize = 256;
