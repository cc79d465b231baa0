//! Classifier contracts
//!
//! The training loop never looks inside a network. It needs a forward pass,
//! named parameters, a train/eval toggle and, on autodiff backends, a way to
//! turn a loss into gradients and to hand the underlying Burn module to an
//! optimizer.

use std::collections::HashMap;

use burn::module::{AutodiffModule, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor,
};

use super::params::{resolve_state_dict, Naming, ParamValues, StateDict};
use crate::utils::error::{FixMatchError, Result};

/// Train/eval toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// A differentiable function with named parameters
pub trait Classifier<B: Backend> {
    /// Images `[batch, channels, height, width]` to logits `[batch, classes]`
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    /// Plain name and id of every trainable parameter
    fn param_ids(&self) -> Vec<(String, ParamId)>;

    /// Current parameter values by id
    fn param_values(&self) -> ParamValues<B>;

    /// Overwrite the parameters whose ids appear in `values`
    fn assign(&mut self, values: HashMap<ParamId, Tensor<B, 1>>);

    /// Naming scheme this model exposes to callers
    fn naming(&self) -> Naming {
        Naming::Plain
    }

    /// Parameter names as exposed under [`Classifier::naming`]
    fn parameter_names(&self) -> Vec<String> {
        let naming = self.naming();
        self.param_ids()
            .iter()
            .map(|(name, _)| naming.apply(name))
            .collect()
    }

    /// Look up a parameter id by its exposed name
    fn parameter_id(&self, name: &str) -> Result<ParamId> {
        let key = self
            .naming()
            .storage_key(name)
            .ok_or_else(|| FixMatchError::KeyNotFound(name.to_string()))?;
        self.param_ids()
            .into_iter()
            .find(|(plain, _)| plain == key)
            .map(|(_, id)| id)
            .ok_or_else(|| FixMatchError::KeyNotFound(name.to_string()))
    }

    /// Snapshot under plain names, whatever the exposed naming
    fn state_dict(&self) -> Result<StateDict> {
        StateDict::from_values(&self.param_ids(), &self.param_values())
    }

    /// Strict restore. Keys written under either naming are accepted.
    fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        let dict = dict.renamed(Naming::Plain)?;
        let values = resolve_state_dict(&self.param_ids(), &self.param_values(), &dict)?;
        self.assign(values);
        Ok(())
    }
}

/// A classifier on an autodiff backend
pub trait TrainableModel<B: AutodiffBackend>: Classifier<B> {
    /// The Burn module an optimizer steps
    type Module: AutodiffModule<B>;

    /// Inference copy living on the inner backend
    type Valid: Classifier<B::InnerBackend>;

    fn module(&self) -> &Self::Module;

    /// Copy the current weights out of the gradient graph, in eval mode
    fn eval_copy(&self) -> Self::Valid;

    /// Run backward on `loss` and collect gradients by parameter id.
    ///
    /// Parameters the loss does not depend on are absent. Nothing
    /// accumulates between calls, so there is no separate zero-grad.
    fn backward(&self, loss: Tensor<B, 1>) -> Result<GradientsParams> {
        Ok(GradientsParams::from_grads(loss.backward(), self.module()))
    }

    /// Replace the underlying module with `f(module)`
    fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Self::Module) -> Result<Self::Module>;
}
