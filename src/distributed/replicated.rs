//! Data-parallel replication wrapper
//!
//! Wrapping a model makes every rank start from rank 0's weights and turns
//! `backward` into a synchronizing call that returns gradients averaged over
//! all ranks. The wrapper exposes its parameters under `module.`-prefixed
//! names while storing them plain.
//!
//! Gradients travel in one packed buffer. Each parameter contributes a
//! presence flag followed by its values (zeros when the rank has no
//! gradient for it). After the mean, a parameter with a zero flag had no
//! gradient on any rank and stays absent everywhere; otherwise every rank
//! gets the same averaged gradient.

use std::collections::HashMap;
use std::sync::Arc;

use burn::module::{Module, ModuleVisitor, Param, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};

use super::group::ProcessGroup;
use crate::model::params::{tensor_to_vec, ParamValues};
use crate::model::{Classifier, Mode, Naming, TrainableModel};
use crate::utils::error::{FixMatchError, Result};

/// A model replicated across the ranks of a process group
#[derive(Debug)]
pub struct Replicated<M> {
    module: M,
    group: Arc<dyn ProcessGroup>,
}

impl<M> Replicated<M> {
    /// Wrap `module` and overwrite its weights with rank 0's
    pub fn new<B>(mut module: M, group: Arc<dyn ProcessGroup>) -> Result<Self>
    where
        B: Backend,
        M: Classifier<B>,
    {
        if group.world_size() > 1 {
            broadcast_params(&mut module, group.as_ref())?;
        }
        Ok(Self { module, group })
    }

    pub fn inner(&self) -> &M {
        &self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }
}

fn broadcast_params<B: Backend, M: Classifier<B>>(module: &mut M, group: &dyn ProcessGroup) -> Result<()> {
    let values = module.param_values();
    let mut flat = Vec::new();
    let mut layout = Vec::new();
    for (name, id) in module.param_ids() {
        let param = values
            .get(&id)
            .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
        flat.extend(tensor_to_vec(param.value.clone())?);
        layout.push((id, param.numel(), param.value.device()));
    }

    let expected = flat.len();
    group.broadcast_from_main(&mut flat)?;
    if flat.len() != expected {
        return Err(FixMatchError::Distributed(format!(
            "Broadcast carried {} values, model has {}",
            flat.len(),
            expected
        )));
    }

    let mut assigned = HashMap::new();
    let mut offset = 0;
    for (id, n, device) in layout {
        let values = flat[offset..offset + n].to_vec();
        assigned.insert(id, Tensor::<B, 1>::from_data(TensorData::new(values, [n]), &device));
        offset += n;
    }
    module.assign(assigned);
    Ok(())
}

/// Packs local gradients as `[flag, values...]` per parameter, in visit order
struct GradPacker<'a> {
    grads: &'a GradientsParams,
    buffer: Vec<f32>,
    error: Option<FixMatchError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradPacker<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let numel: usize = param.val().dims().iter().product();
        let local = self
            .grads
            .get::<B::InnerBackend, D>(param.id)
            .map(|grad| tensor_to_vec(grad.reshape([numel])));

        match local {
            Some(Ok(values)) if values.len() == numel => {
                self.buffer.push(1.0);
                self.buffer.extend(values);
            }
            Some(Ok(values)) => {
                self.error.get_or_insert(FixMatchError::Distributed(format!(
                    "Gradient has {} values, parameter has {}",
                    values.len(),
                    numel
                )));
                self.buffer.extend(std::iter::repeat(0.0).take(numel + 1));
            }
            Some(Err(err)) => {
                self.error.get_or_insert(err);
                self.buffer.extend(std::iter::repeat(0.0).take(numel + 1));
            }
            None => self.buffer.extend(std::iter::repeat(0.0).take(numel + 1)),
        }
    }
}

/// Registers averaged gradients for parameters some rank had a gradient for
struct GradUnpacker<'a> {
    buffer: &'a [f32],
    offset: usize,
    grads: GradientsParams,
    error: Option<FixMatchError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradUnpacker<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let dims = tensor.dims();
        let numel: usize = dims.iter().product();

        let Some(chunk) = self.buffer.get(self.offset..self.offset + numel + 1) else {
            self.error.get_or_insert(FixMatchError::Distributed(format!(
                "Gradient buffer of {} values ends before parameter {:?}",
                self.buffer.len(),
                param.id
            )));
            return;
        };
        self.offset += numel + 1;

        if chunk[0] > 0.0 {
            let grad = Tensor::<B::InnerBackend, 1>::from_data(
                TensorData::new(chunk[1..].to_vec(), [numel]),
                &tensor.device(),
            )
            .reshape(dims);
            self.grads.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

impl<B: Backend, M: Classifier<B>> Classifier<B> for Replicated<M> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.module.forward(images)
    }

    fn num_classes(&self) -> usize {
        self.module.num_classes()
    }

    fn mode(&self) -> Mode {
        self.module.mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.module.set_mode(mode)
    }

    fn param_ids(&self) -> Vec<(String, ParamId)> {
        self.module.param_ids()
    }

    fn param_values(&self) -> ParamValues<B> {
        self.module.param_values()
    }

    fn assign(&mut self, values: HashMap<ParamId, Tensor<B, 1>>) {
        self.module.assign(values)
    }

    fn naming(&self) -> Naming {
        Naming::Wrapped
    }
}

impl<B: AutodiffBackend, M: TrainableModel<B>> TrainableModel<B> for Replicated<M> {
    type Module = M::Module;
    type Valid = M::Valid;

    fn module(&self) -> &Self::Module {
        self.module.module()
    }

    fn eval_copy(&self) -> Self::Valid {
        self.module.eval_copy()
    }

    /// Local backward, then one all-reduce over every gradient packed into a
    /// single buffer
    fn backward(&self, loss: Tensor<B, 1>) -> Result<GradientsParams> {
        let local = self.module.backward(loss)?;
        if self.group.world_size() == 1 {
            return Ok(local);
        }

        let mut packer = GradPacker {
            grads: &local,
            buffer: Vec::new(),
            error: None,
        };
        self.module.module().visit(&mut packer);
        if let Some(err) = packer.error {
            return Err(err);
        }
        let mut buffer = packer.buffer;

        self.group.all_reduce_mean(&mut buffer)?;

        let mut unpacker = GradUnpacker {
            buffer: &buffer,
            offset: 0,
            grads: GradientsParams::new(),
            error: None,
        };
        self.module.module().visit(&mut unpacker);
        if let Some(err) = unpacker.error {
            return Err(err);
        }
        Ok(unpacker.grads)
    }

    fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Self::Module) -> Result<Self::Module>,
    {
        self.module.update(f)
    }
}
