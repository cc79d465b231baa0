//! Reference classifier
//!
//! A small fully connected network: flatten, linear, layer normalization,
//! ReLU, linear. It is enough to drive the training loop end to end on CPU
//! and its parameter names exercise the weight-decay split (`*.bias` and
//! `normalization.*` are exempt).

use std::collections::HashMap;

use burn::{
    config::Config,
    module::{AutodiffModule, Ignored, Module, ParamId},
    nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig, Relu},
    tensor::{backend::AutodiffBackend, backend::Backend, Tensor, TensorData},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::classifier::{Classifier, Mode, TrainableModel};
use super::params::{assign_params, collect_params, ParamValues};

/// Configuration for [`MlpClassifier`]
#[derive(Config, Debug)]
pub struct MlpClassifierConfig {
    /// Flattened input size (channels * height * width)
    pub input_dim: usize,

    /// Number of output classes
    pub num_classes: usize,

    /// Width of the hidden layer
    #[config(default = "256")]
    pub hidden_dim: usize,

    /// Seed for weight initialization
    #[config(default = "0")]
    pub seed: u64,
}

impl MlpClassifierConfig {
    /// Initialize the model. Biases start at zero, the normalization at
    /// identity, and linear weights uniform in `±1/sqrt(fan_in)` drawn from
    /// `seed`, so every rank builds the same network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpClassifier<B> {
        let model = MlpClassifier {
            fc1: LinearConfig::new(self.input_dim, self.hidden_dim)
                .with_initializer(Initializer::Zeros)
                .init(device),
            normalization: LayerNormConfig::new(self.hidden_dim).init(device),
            activation: Relu::new(),
            fc2: LinearConfig::new(self.hidden_dim, self.num_classes)
                .with_initializer(Initializer::Zeros)
                .init(device),
            num_classes: self.num_classes,
            mode: Ignored(Mode::Train),
        };

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut weights = HashMap::new();
        for (id, fan_in, fan_out) in [
            (model.fc1.weight.id, self.input_dim, self.hidden_dim),
            (model.fc2.weight.id, self.hidden_dim, self.num_classes),
        ] {
            let bound = 1.0 / (fan_in as f32).sqrt();
            let values: Vec<f32> = (0..fan_in * fan_out)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            let n = values.len();
            weights.insert(id, Tensor::<B, 1>::from_data(TensorData::new(values, [n]), device));
        }

        assign_params(model, weights)
    }
}

/// Flatten → fc1 → normalization → ReLU → fc2
#[derive(Module, Debug)]
pub struct MlpClassifier<B: Backend> {
    pub fc1: Linear<B>,
    pub normalization: LayerNorm<B>,
    pub activation: Relu,
    pub fc2: Linear<B>,
    num_classes: usize,
    mode: Ignored<Mode>,
}

fn linear_ids<B: Backend>(prefix: &str, layer: &Linear<B>, ids: &mut Vec<(String, ParamId)>) {
    ids.push((format!("{}.weight", prefix), layer.weight.id));
    if let Some(bias) = &layer.bias {
        ids.push((format!("{}.bias", prefix), bias.id));
    }
}

impl<B: Backend> MlpClassifier<B> {
    pub fn input_dim(&self) -> usize {
        self.fc1.weight.val().dims()[0]
    }

    pub fn hidden_dim(&self) -> usize {
        self.fc1.weight.val().dims()[1]
    }
}

impl<B: Backend> Classifier<B> for MlpClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, height, width] = images.dims();
        let x = images.reshape([batch, channels * height * width]);

        let x = self.fc1.forward(x);
        let x = self.normalization.forward(x);
        let x = self.activation.forward(x);
        self.fc2.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn mode(&self) -> Mode {
        self.mode.0
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = Ignored(mode);
    }

    fn param_ids(&self) -> Vec<(String, ParamId)> {
        let mut ids = Vec::with_capacity(6);
        linear_ids("fc1", &self.fc1, &mut ids);
        ids.push(("normalization.gamma".to_string(), self.normalization.gamma.id));
        ids.push(("normalization.beta".to_string(), self.normalization.beta.id));
        linear_ids("fc2", &self.fc2, &mut ids);
        ids
    }

    fn param_values(&self) -> ParamValues<B> {
        collect_params(self)
    }

    fn assign(&mut self, values: HashMap<ParamId, Tensor<B, 1>>) {
        *self = assign_params(self.clone(), values);
    }
}

impl<B: AutodiffBackend> TrainableModel<B> for MlpClassifier<B> {
    type Module = Self;
    type Valid = MlpClassifier<B::InnerBackend>;

    fn module(&self) -> &Self {
        self
    }

    fn eval_copy(&self) -> Self::Valid {
        let mut valid = AutodiffModule::valid(self);
        valid.set_mode(Mode::Eval);
        valid
    }

    fn update<F>(&mut self, f: F) -> crate::utils::error::Result<()>
    where
        F: FnOnce(Self) -> crate::utils::error::Result<Self>,
    {
        *self = f(self.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::StateDict;
    use crate::utils::error::FixMatchError;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Int;

    type TestBackend = Autodiff<NdArray>;

    fn config() -> MlpClassifierConfig {
        MlpClassifierConfig::new(12, 3).with_hidden_dim(8).with_seed(7)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model: MlpClassifier<NdArray> = config().init(&device);
        let input = Tensor::<NdArray, 4>::zeros([5, 3, 2, 2], &device);
        assert_eq!(model.forward(input).dims(), [5, 3]);
        assert_eq!(model.input_dim(), 12);
        assert_eq!(model.hidden_dim(), 8);
    }

    #[test]
    fn test_parameter_names() {
        let device = Default::default();
        let model: MlpClassifier<NdArray> = config().init(&device);
        assert_eq!(
            model.parameter_names(),
            vec![
                "fc1.weight",
                "fc1.bias",
                "normalization.gamma",
                "normalization.beta",
                "fc2.weight",
                "fc2.bias",
            ]
        );
        assert_eq!(model.parameter_id("fc1.weight").unwrap(), model.fc1.weight.id);
        assert!(matches!(
            model.parameter_id("module.fc1.weight"),
            Err(FixMatchError::KeyNotFound(_))
        ));
        assert!(matches!(
            model.parameter_id("fc3.weight"),
            Err(FixMatchError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_every_named_parameter_is_visited() {
        let model: MlpClassifier<NdArray> = config().init(&Default::default());
        let values = model.param_values();
        assert_eq!(values.len(), model.param_ids().len());
        assert_eq!(model.num_params(), values.values().map(|p| p.numel()).sum::<usize>());
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let device = Default::default();
        let a: MlpClassifier<NdArray> = config().init(&device);
        let b: MlpClassifier<NdArray> = config().init(&device);
        let c: MlpClassifier<NdArray> = config().with_seed(8).init(&device);
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
        assert_ne!(a.state_dict().unwrap(), c.state_dict().unwrap());

        let dict = a.state_dict().unwrap();
        assert!(dict.get("fc1.bias").unwrap().values.iter().all(|&v| v == 0.0));
        assert!(dict.get("normalization.gamma").unwrap().values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_load_state_dict_keeps_ids() {
        let device = Default::default();
        let source: MlpClassifier<NdArray> = config().init(&device);
        let mut target: MlpClassifier<NdArray> = config().with_seed(3).init(&device);
        let ids = target.param_ids();

        target.load_state_dict(&source.state_dict().unwrap()).unwrap();
        assert_eq!(target.param_ids(), ids);
        assert_eq!(target.state_dict().unwrap(), source.state_dict().unwrap());
    }

    #[test]
    fn test_backward_reaches_every_parameter() {
        let device = Default::default();
        let model: MlpClassifier<TestBackend> = config().init(&device);
        let input = Tensor::<TestBackend, 4>::ones([4, 3, 2, 2], &device);
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 2, 0], [4]), &device);

        let logits = model.forward(input);
        let loss = crate::training::loss::cross_entropy(logits, targets);
        let grads = model.backward(loss).unwrap();

        assert_eq!(grads.len(), 6);
        let weight_grad = grads
            .get::<NdArray, 2>(model.fc1.weight.id)
            .expect("fc1.weight has a gradient");
        assert_eq!(weight_grad.dims(), [12, 8]);
    }

    #[test]
    fn test_eval_copy_has_same_weights_in_eval_mode() {
        let device = Default::default();
        let model: MlpClassifier<TestBackend> = config().init(&device);
        let valid = model.eval_copy();
        assert_eq!(valid.mode(), Mode::Eval);
        assert_eq!(model.mode(), Mode::Train);

        let a: StateDict = model.state_dict().unwrap();
        let b: StateDict = valid.state_dict().unwrap();
        assert_eq!(a, b);
    }
}
