//! Exponential moving average of model weights
//!
//! After every optimizer step:
//!   shadow = decay * shadow + (1 - decay) * live
//!
//! The shadow lives on the inner (non-autodiff) backend, so its parameters
//! cannot receive gradients. It is always in eval mode and is what gets
//! evaluated when EMA is enabled.

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::tensor::backend::AutodiffBackend;

use crate::model::{Classifier, Mode, StateDict, TrainableModel};
use crate::utils::error::{FixMatchError, Result};

/// EMA shadow of a trainable model
pub struct ModelEma<B: AutodiffBackend, V: Classifier<B::InnerBackend>> {
    shadow: V,
    decay: f64,
    num_updates: u64,
    _backend: PhantomData<B>,
}

impl<B, V> ModelEma<B, V>
where
    B: AutodiffBackend,
    V: Classifier<B::InnerBackend>,
{
    /// Start the shadow as a detached copy of `live`
    pub fn new<M>(live: &M, decay: f64) -> Result<Self>
    where
        M: TrainableModel<B, Valid = V>,
    {
        if !(decay > 0.0 && decay < 1.0) {
            return Err(FixMatchError::Config(format!(
                "EMA decay must be in (0, 1), got {}",
                decay
            )));
        }

        let mut shadow = live.eval_copy();
        shadow.set_mode(Mode::Eval);

        Ok(Self {
            shadow,
            decay,
            num_updates: 0,
            _backend: PhantomData,
        })
    }

    /// Blend the live model's current weights into the shadow.
    ///
    /// Every shadow parameter is looked up in `live` through the live model's
    /// naming, so a replication-wrapped model is matched by its prefixed
    /// names. A parameter that cannot be found fails the whole update and
    /// leaves the shadow untouched.
    pub fn update<M: Classifier<B>>(&mut self, live: &M) -> Result<()> {
        let naming = live.naming();
        let live_values = live.param_values();
        let shadow_values = self.shadow.param_values();
        let decay = self.decay;

        let mut blended = HashMap::new();
        for (name, shadow_id) in self.shadow.param_ids() {
            let live_id = live.parameter_id(&naming.apply(&name))?;
            let live_param = live_values
                .get(&live_id)
                .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
            let shadow_param = shadow_values
                .get(&shadow_id)
                .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
            if live_param.shape != shadow_param.shape {
                return Err(FixMatchError::ShapeMismatch {
                    name,
                    expected: shadow_param.shape.clone(),
                    actual: live_param.shape.clone(),
                });
            }

            let live_value = live_param.value.clone().inner();
            blended.insert(
                shadow_id,
                shadow_param.value.clone().mul_scalar(decay) + live_value.mul_scalar(1.0 - decay),
            );
        }

        self.shadow.assign(blended);
        self.num_updates += 1;
        Ok(())
    }

    /// The shadow model, in eval mode
    pub fn model(&self) -> &V {
        &self.shadow
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// Shadow weights under plain names
    pub fn state_dict(&self) -> Result<StateDict> {
        self.shadow.state_dict()
    }

    /// Restore shadow weights saved under either naming
    pub fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        self.shadow.load_state_dict(dict)?;
        self.shadow.set_mode(Mode::Eval);
        Ok(())
    }
}
