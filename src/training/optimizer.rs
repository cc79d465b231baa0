//! SGD with momentum and per-group weight decay
//!
//! Each parameter group gets its own `burn::optim::Sgd`, configured with the
//! group's weight decay. A step splits the gradients by `ParamId` and lets
//! every group's optimizer update only its own parameters. Burn's update,
//! with `mu` the momentum, no dampening and `wd` the group's decay:
//!   d = g + wd * p
//!   buf = mu * buf + d        (buf = d on first use)
//!   d = d + mu * buf          (nesterov) or d = buf
//!   p = p - lr * d

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use burn::module::{AutodiffModule, ModuleVisitor, Param, ParamId};
use burn::optim::{
    adaptor::OptimizerAdaptor, decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams,
    Optimizer, Sgd, SgdConfig,
};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::error::{FixMatchError, Result};

/// Parameter-name substrings that opt a parameter out of weight decay
pub const DEFAULT_NO_DECAY: [&str; 3] = ["bias", "bn", "normalization"];

type SgdAdaptor<B, M> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;
type SgdRecord<B, M> = <SgdAdaptor<B, M> as Optimizer<M, B>>::Record;

/// Named set of parameters sharing a weight-decay coefficient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub weight_decay: f64,
    pub params: Vec<String>,
}

/// SGD hyperparameters shared by every group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedSgdConfig {
    pub momentum: f64,
    pub nesterov: bool,
    /// Coefficient applied to the decay group
    pub weight_decay: f64,
    /// Substrings marking decay-exempt parameters
    pub no_decay: Vec<String>,
}

impl Default for GroupedSgdConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            nesterov: true,
            weight_decay: 1e-3,
            no_decay: DEFAULT_NO_DECAY.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl GroupedSgdConfig {
    /// Burn SGD settings for a group decaying at `weight_decay`
    fn burn_config(&self, weight_decay: f64) -> SgdConfig {
        let momentum = (self.momentum != 0.0).then(|| {
            MomentumConfig::new()
                .with_momentum(self.momentum)
                .with_dampening(0.0)
                .with_nesterov(self.nesterov)
        });
        let weight_decay = (weight_decay != 0.0).then(|| WeightDecayConfig::new(weight_decay as f32));
        SgdConfig::new()
            .with_momentum(momentum)
            .with_weight_decay(weight_decay)
    }
}

/// Persisted optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub groups: Vec<ParamGroup>,
    /// Encoded Burn SGD record (the momentum buffer) by plain parameter
    /// name. Parameters that never received a gradient have no entry.
    pub momentum: BTreeMap<String, Vec<u8>>,
}

/// Split `names` into a decay group and an exempt group
pub fn partition_params(names: &[String], no_decay: &[String], weight_decay: f64) -> Vec<ParamGroup> {
    let (exempt, decay): (Vec<String>, Vec<String>) = names
        .iter()
        .cloned()
        .partition(|name| no_decay.iter().any(|nd| name.contains(nd.as_str())));

    vec![
        ParamGroup {
            weight_decay,
            params: decay,
        },
        ParamGroup {
            weight_decay: 0.0,
            params: exempt,
        },
    ]
}

/// Check that `groups` cover `names` exactly once each
pub fn validate_partition(groups: &[ParamGroup], names: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in groups.iter().flat_map(|g| g.params.iter()) {
        if !seen.insert(name.as_str()) {
            return Err(FixMatchError::Config(format!(
                "Parameter '{}' appears in more than one optimizer group",
                name
            )));
        }
    }

    let expected: BTreeSet<&str> = names.iter().map(|s| s.as_str()).collect();
    if let Some(missing) = expected.difference(&seen).next() {
        return Err(FixMatchError::Config(format!(
            "Parameter '{}' is not in any optimizer group",
            missing
        )));
    }
    if let Some(extra) = seen.difference(&expected).next() {
        return Err(FixMatchError::Config(format!(
            "Optimizer group names unknown parameter '{}'",
            extra
        )));
    }
    Ok(())
}

/// Moves the gradients of one group's parameters into their own set
struct GroupGrads<'a> {
    ids: &'a HashSet<ParamId>,
    from: &'a mut GradientsParams,
    into: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GroupGrads<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if !self.ids.contains(&param.id) {
            return;
        }
        if let Some(grad) = self.from.remove::<B::InnerBackend, D>(param.id) {
            self.into.register::<B::InnerBackend, D>(param.id, grad);
        }
    }
}

struct GroupOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    group: ParamGroup,
    ids: HashSet<ParamId>,
    optim: SgdAdaptor<B, M>,
}

/// SGD over the module `M`, one Burn optimizer per parameter group
pub struct GroupedSgd<B: AutodiffBackend, M: AutodiffModule<B>> {
    config: GroupedSgdConfig,
    /// Plain name and id of every parameter the groups cover
    params: Vec<(String, ParamId)>,
    groups: Vec<GroupOptimizer<B, M>>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> GroupedSgd<B, M> {
    /// Build the optimizer for parameters given as (plain name, id)
    pub fn new(config: GroupedSgdConfig, params: &[(String, ParamId)]) -> Result<Self> {
        let names: Vec<String> = params.iter().map(|(name, _)| name.clone()).collect();
        let groups = partition_params(&names, &config.no_decay, config.weight_decay);
        Self::with_groups(config, groups, params)
    }

    /// Build the optimizer from explicit groups, which must partition `params`
    pub fn with_groups(config: GroupedSgdConfig, groups: Vec<ParamGroup>, params: &[(String, ParamId)]) -> Result<Self> {
        let names: Vec<String> = params.iter().map(|(name, _)| name.clone()).collect();
        validate_partition(&groups, &names)?;

        debug!(
            "SGD groups: {}",
            groups
                .iter()
                .map(|g| format!("{} params @ wd={}", g.params.len(), g.weight_decay))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let id_of: HashMap<&str, ParamId> = params.iter().map(|(name, id)| (name.as_str(), *id)).collect();
        let groups = groups
            .into_iter()
            .map(|group| GroupOptimizer {
                ids: group
                    .params
                    .iter()
                    .filter_map(|name| id_of.get(name.as_str()).copied())
                    .collect(),
                optim: config.burn_config(group.weight_decay).init(),
                group,
            })
            .collect();

        Ok(Self {
            config,
            params: params.to_vec(),
            groups,
        })
    }

    pub fn groups(&self) -> Vec<&ParamGroup> {
        self.groups.iter().map(|g| &g.group).collect()
    }

    pub fn config(&self) -> &GroupedSgdConfig {
        &self.config
    }

    /// Apply one update at learning rate `lr`.
    ///
    /// Parameters without a gradient are left alone, and so is their
    /// momentum.
    pub fn step(&mut self, lr: f64, mut module: M, mut grads: GradientsParams) -> M {
        for group in self.groups.iter_mut() {
            let mut split = GroupGrads {
                ids: &group.ids,
                from: &mut grads,
                into: GradientsParams::new(),
            };
            module.visit(&mut split);
            let group_grads = split.into;
            module = group.optim.step(lr, module, group_grads);
        }
        module
    }

    /// Snapshot groups and momentum buffers
    pub fn state(&self) -> Result<OptimizerState> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let name_of: HashMap<ParamId, &str> = self.params.iter().map(|(name, id)| (*id, name.as_str())).collect();

        let mut momentum = BTreeMap::new();
        for group in &self.groups {
            for (id, entry) in group.optim.to_record() {
                let name = name_of.get(&id).ok_or_else(|| {
                    FixMatchError::Model(format!("Optimizer holds state for unknown parameter {:?}", id))
                })?;
                momentum.insert(name.to_string(), Recorder::<B>::record(&recorder, entry, ())?);
            }
        }

        Ok(OptimizerState {
            groups: self.groups.iter().map(|g| g.group.clone()).collect(),
            momentum,
        })
    }

    /// Restore a snapshot taken from a model with the same parameter names.
    /// Ids may differ; buffers are matched by name.
    pub fn load_state(self, state: &OptimizerState, device: &B::Device) -> Result<Self> {
        if let Some(unknown) = state
            .momentum
            .keys()
            .find(|k| !self.params.iter().any(|(name, _)| name == *k))
        {
            return Err(FixMatchError::UnexpectedKey(unknown.clone()));
        }

        let mut restored = Self::with_groups(self.config, state.groups.clone(), &self.params)?;
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let id_of: HashMap<&str, ParamId> = restored
            .params
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
            .collect();

        for group in restored.groups.iter_mut() {
            let mut record: SgdRecord<B, M> = Default::default();
            for name in &group.group.params {
                let (Some(bytes), Some(id)) = (state.momentum.get(name), id_of.get(name.as_str())) else {
                    continue;
                };
                record.insert(*id, Recorder::<B>::load(&recorder, bytes.clone(), device)?);
            }
            group.optim = group.optim.clone().load_record(record);
        }
        Ok(restored)
    }
}
