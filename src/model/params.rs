//! Parameter naming and state dicts
//!
//! Models are Burn modules; their parameters are reached through
//! `Module::visit`/`Module::map` and identified by `ParamId`. A model also
//! reports a plain name (`fc1.weight`) for every id, which is what state
//! dicts and checkpoints are keyed by.

use std::collections::{BTreeMap, HashMap};

use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::utils::error::{FixMatchError, Result};

/// Name prefix a replication wrapper adds to every parameter
pub const WRAPPER_PREFIX: &str = "module.";

/// Which parameter naming scheme a model exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Naming {
    /// `fc1.weight`
    Plain,
    /// `module.fc1.weight`
    Wrapped,
}

impl Naming {
    /// Canonicalize `name`, written under either scheme, into this scheme.
    ///
    /// This is the only place the wrapper prefix is added or stripped. EMA
    /// updates, EMA restores and checkpoint restores all go through it.
    pub fn apply(self, name: &str) -> String {
        let plain = name.strip_prefix(WRAPPER_PREFIX).unwrap_or(name);
        match self {
            Naming::Plain => plain.to_string(),
            Naming::Wrapped => format!("{}{}", WRAPPER_PREFIX, plain),
        }
    }

    /// Resolve a name exposed under this scheme to the plain storage key.
    ///
    /// Unlike [`Naming::apply`] this is strict: a wrapped model only answers
    /// to prefixed names and a plain model only to unprefixed ones.
    pub fn storage_key<'a>(self, name: &'a str) -> Option<&'a str> {
        match self {
            Naming::Plain if name.starts_with(WRAPPER_PREFIX) => None,
            Naming::Plain => Some(name),
            Naming::Wrapped => name.strip_prefix(WRAPPER_PREFIX),
        }
    }
}

/// Current value of one parameter, flattened
#[derive(Debug, Clone)]
pub struct FlatParam<B: Backend> {
    /// Shape of the parameter inside the module
    pub shape: Vec<usize>,
    pub value: Tensor<B, 1>,
}

impl<B: Backend> FlatParam<B> {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Flattened parameter values by id
pub type ParamValues<B> = HashMap<ParamId, FlatParam<B>>;

struct Collector<B: Backend> {
    values: ParamValues<B>,
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        let numel: usize = shape.iter().product();
        self.values.insert(
            param.id,
            FlatParam {
                shape,
                value: tensor.reshape([numel]),
            },
        );
    }
}

struct Assigner<B: Backend> {
    values: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleMapper<B> for Assigner<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(flat) = self.values.remove(&param.id) else {
            return param;
        };
        param.map(|tensor| {
            let require_grad = tensor.is_require_grad();
            flat.to_device(&tensor.device())
                .reshape(tensor.dims())
                .set_require_grad(require_grad)
        })
    }
}

/// Every float parameter of `module`, flattened
pub fn collect_params<B: Backend, M: Module<B>>(module: &M) -> ParamValues<B> {
    let mut collector = Collector {
        values: HashMap::new(),
    };
    module.visit(&mut collector);
    collector.values
}

/// Overwrite the parameters named by id in `values`. Each value must hold
/// exactly as many elements as the parameter it replaces.
pub fn assign_params<B: Backend, M: Module<B>>(module: M, values: HashMap<ParamId, Tensor<B, 1>>) -> M {
    module.map(&mut Assigner { values })
}

/// Host copy of one tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorRecord {
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::<B, 1>::from_data(
            TensorData::new(self.values.clone(), [self.values.len()]),
            device,
        )
    }

    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 1>, shape: Vec<usize>) -> Result<Self> {
        Ok(Self {
            shape,
            values: tensor_to_vec(tensor)?,
        })
    }
}

/// Serializable snapshot of a model's parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict(pub BTreeMap<String, TensorRecord>);

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `values` under the plain names in `ids`
    pub fn from_values<B: Backend>(ids: &[(String, ParamId)], values: &ParamValues<B>) -> Result<Self> {
        let mut dict = BTreeMap::new();
        for (name, id) in ids {
            let param = values
                .get(id)
                .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
            dict.insert(
                name.clone(),
                TensorRecord::from_tensor(param.value.clone(), param.shape.clone())?,
            );
        }
        Ok(Self(dict))
    }

    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: TensorRecord) {
        self.0.insert(name.into(), record);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rewrite every key into `naming`. Two keys collapsing onto the same
    /// canonical name is an error.
    pub fn renamed(&self, naming: Naming) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (name, record) in &self.0 {
            let key = naming.apply(name);
            if out.insert(key.clone(), record.clone()).is_some() {
                return Err(FixMatchError::UnexpectedKey(key));
            }
        }
        Ok(Self(out))
    }
}

/// Match `dict` (already in plain naming) against a model's parameters.
///
/// Every parameter must be present with a matching shape and no extra keys
/// are allowed. Nothing is returned unless the whole dict checks out.
pub fn resolve_state_dict<B: Backend>(
    ids: &[(String, ParamId)],
    current: &ParamValues<B>,
    dict: &StateDict,
) -> Result<HashMap<ParamId, Tensor<B, 1>>> {
    if let Some(extra) = dict.keys().find(|k| !ids.iter().any(|(name, _)| name == *k)) {
        return Err(FixMatchError::UnexpectedKey(extra.clone()));
    }

    let mut resolved = HashMap::new();
    for (name, id) in ids {
        let param = current
            .get(id)
            .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
        let record = dict
            .get(name)
            .ok_or_else(|| FixMatchError::KeyNotFound(name.clone()))?;
        if record.shape != param.shape || record.values.len() != param.numel() {
            return Err(FixMatchError::ShapeMismatch {
                name: name.clone(),
                expected: param.shape.clone(),
                actual: record.shape.clone(),
            });
        }
        resolved.insert(*id, record.to_tensor::<B>(&param.value.device()));
    }
    Ok(resolved)
}

/// Copy a 1-D float tensor to a host vector
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| FixMatchError::Model(format!("Failed to read tensor data: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{Linear, LinearConfig};

    type B = NdArray;

    fn linear() -> Linear<B> {
        LinearConfig::new(2, 2).init(&Default::default())
    }

    fn ids(layer: &Linear<B>) -> Vec<(String, ParamId)> {
        let mut ids = vec![("fc.weight".to_string(), layer.weight.id)];
        if let Some(bias) = &layer.bias {
            ids.push(("fc.bias".to_string(), bias.id));
        }
        ids
    }

    fn flat(values: Vec<f32>) -> Tensor<B, 1> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn test_naming_apply() {
        assert_eq!(Naming::Plain.apply("module.fc.weight"), "fc.weight");
        assert_eq!(Naming::Plain.apply("fc.weight"), "fc.weight");
        assert_eq!(Naming::Wrapped.apply("fc.weight"), "module.fc.weight");
        assert_eq!(Naming::Wrapped.apply("module.fc.weight"), "module.fc.weight");
    }

    #[test]
    fn test_storage_key_is_strict() {
        assert_eq!(Naming::Wrapped.storage_key("module.fc.bias"), Some("fc.bias"));
        assert_eq!(Naming::Wrapped.storage_key("fc.bias"), None);
        assert_eq!(Naming::Plain.storage_key("fc.bias"), Some("fc.bias"));
        assert_eq!(Naming::Plain.storage_key("module.fc.bias"), None);
    }

    #[test]
    fn test_collect_and_assign_by_id() {
        let layer = linear();
        let collected = collect_params(&layer);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[&layer.weight.id].shape, vec![2, 2]);

        let mut values = HashMap::new();
        values.insert(layer.weight.id, flat(vec![1.0, 2.0, 3.0, 4.0]));
        let weight_id = layer.weight.id;
        let layer = assign_params(layer, values);

        assert_eq!(layer.weight.id, weight_id);
        let weight: Vec<f32> = layer.weight.val().into_data().to_vec().unwrap();
        assert_eq!(weight, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_state_dict_round_trip() {
        let source = linear();
        let dict = StateDict::from_values(&ids(&source), &collect_params(&source)).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("fc.weight").unwrap().shape, vec![2, 2]);

        let target = linear();
        let resolved = resolve_state_dict(&ids(&target), &collect_params(&target), &dict).unwrap();
        let target_ids = ids(&target);
        let target = assign_params(target, resolved);
        assert_eq!(
            StateDict::from_values(&target_ids, &collect_params(&target)).unwrap(),
            dict
        );
    }

    #[test]
    fn test_resolve_rejects_missing_and_extra_keys() {
        let target = linear();
        let current = collect_params(&target);
        let mut dict = StateDict::from_values(&ids(&target), &current).unwrap();

        let mut missing = dict.clone();
        missing.0.remove("fc.bias");
        assert!(matches!(
            resolve_state_dict(&ids(&target), &current, &missing),
            Err(FixMatchError::KeyNotFound(k)) if k == "fc.bias"
        ));

        dict.insert(
            "fc2.bias",
            TensorRecord {
                shape: vec![1],
                values: vec![0.0],
            },
        );
        assert!(matches!(
            resolve_state_dict(&ids(&target), &current, &dict),
            Err(FixMatchError::UnexpectedKey(k)) if k == "fc2.bias"
        ));
    }

    #[test]
    fn test_resolve_rejects_shape_mismatch() {
        let target = linear();
        let current = collect_params(&target);
        let mut dict = StateDict::from_values(&ids(&target), &current).unwrap();
        dict.insert(
            "fc.bias",
            TensorRecord {
                shape: vec![3],
                values: vec![0.0; 3],
            },
        );
        assert!(matches!(
            resolve_state_dict(&ids(&target), &current, &dict),
            Err(FixMatchError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_renamed_detects_collisions() {
        let record = TensorRecord {
            shape: vec![1],
            values: vec![1.0],
        };
        let mut dict = StateDict::new();
        dict.insert("module.fc.bias", record.clone());
        let plain = dict.renamed(Naming::Plain).unwrap();
        assert!(plain.get("fc.bias").is_some());

        dict.insert("fc.bias", record);
        assert!(dict.renamed(Naming::Plain).is_err());
    }
}
