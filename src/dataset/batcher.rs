//! Batching into device tensors
//!
//! Items arrive already augmented, with values in `[0, 1]`. The batcher
//! stacks them and applies per-channel normalization on the device.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use super::{ImageItem, ImageShape, Normalization};

/// A batch of labeled images
#[derive(Clone, Debug)]
pub struct LabeledBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

/// Two views of the same unlabeled images; labels are never materialized
#[derive(Clone, Debug)]
pub struct UnlabeledBatch<B: Backend> {
    pub weak: Tensor<B, 4>,
    pub strong: Tensor<B, 4>,
}

/// Weak and strong views of one unlabeled image
#[derive(Clone, Debug)]
pub struct UnlabeledItem {
    pub weak: Vec<f32>,
    pub strong: Vec<f32>,
}

/// Stacks items and normalizes them
#[derive(Clone, Debug)]
pub struct FixMatchBatcher {
    shape: ImageShape,
    normalization: Normalization,
}

impl FixMatchBatcher {
    pub fn new(shape: ImageShape, normalization: Normalization) -> Self {
        Self {
            shape,
            normalization,
        }
    }

    fn images<B: Backend>(&self, pixels: Vec<f32>, batch_size: usize, device: &B::Device) -> Tensor<B, 4> {
        let ImageShape {
            channels,
            height,
            width,
        } = self.shape;
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [batch_size, channels, height, width]),
            device,
        );

        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(self.normalization.mean.clone(), [1, channels, 1, 1]),
            device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(self.normalization.std.clone(), [1, channels, 1, 1]),
            device,
        );

        (images - mean) / std
    }
}

impl<B: Backend> Batcher<B, ImageItem, LabeledBatch<B>> for FixMatchBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> LabeledBatch<B> {
        let batch_size = items.len();

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let pixels: Vec<f32> = items.into_iter().flat_map(|item| item.pixels).collect();

        let images = self.images::<B>(pixels, batch_size, device);
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        LabeledBatch { images, targets }
    }
}

impl<B: Backend> Batcher<B, UnlabeledItem, UnlabeledBatch<B>> for FixMatchBatcher {
    fn batch(&self, items: Vec<UnlabeledItem>, device: &B::Device) -> UnlabeledBatch<B> {
        let batch_size = items.len();
        let mut weak = Vec::with_capacity(batch_size * self.shape.numel());
        let mut strong = Vec::with_capacity(batch_size * self.shape.numel());
        for item in items {
            weak.extend(item.weak);
            strong.extend(item.strong);
        }

        UnlabeledBatch {
            weak: self.images::<B>(weak, batch_size, device),
            strong: self.images::<B>(strong, batch_size, device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::tensor_to_vec;
    use burn::backend::NdArray;

    type B = NdArray;

    fn batcher() -> FixMatchBatcher {
        FixMatchBatcher::new(
            ImageShape {
                channels: 2,
                height: 1,
                width: 2,
            },
            Normalization::new(&[0.5, 0.0], &[0.5, 2.0]),
        )
    }

    #[test]
    fn test_labeled_batch_normalizes_per_channel() {
        let device = Default::default();
        let items = vec![
            ImageItem {
                pixels: vec![1.0, 0.5, 1.0, 0.0],
                label: 1,
            },
            ImageItem {
                pixels: vec![0.0, 0.0, 0.0, 0.0],
                label: 0,
            },
        ];
        let batch: LabeledBatch<B> = batcher().batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 2, 1, 2]);
        let values = tensor_to_vec(batch.images.reshape([8])).unwrap();
        assert_eq!(values, vec![1.0, 0.0, 0.5, 0.0, -1.0, -1.0, 0.0, 0.0]);

        let targets = batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![1, 0]);
    }

    #[test]
    fn test_unlabeled_batch_keeps_views_apart() {
        let device = Default::default();
        let items = vec![UnlabeledItem {
            weak: vec![0.5; 4],
            strong: vec![1.0; 4],
        }];
        let batch: UnlabeledBatch<B> = batcher().batch(items, &device);

        assert_eq!(batch.weak.dims(), [1, 2, 1, 2]);
        assert_eq!(tensor_to_vec(batch.weak.reshape([4])).unwrap(), vec![0.0, 0.0, 0.25, 0.25]);
        assert_eq!(tensor_to_vec(batch.strong.reshape([4])).unwrap(), vec![1.0, 1.0, 0.5, 0.5]);
    }
}
