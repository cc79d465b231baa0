//! Cycling, rank-sharded loaders
//!
//! Training loaders never run dry: when a pass over the shard ends they
//! reshuffle and start over, so the epoch length is set by the iteration
//! count alone. Every rank shuffles with the same seed and keeps every
//! `world_size`-th position, giving disjoint shards. The test loader is a
//! plain finite pass that keeps the ragged last batch.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::augmentation::Augmenter;
use super::batcher::{FixMatchBatcher, LabeledBatch, UnlabeledBatch, UnlabeledItem};
use super::{ImageDataset, ImageItem};
use crate::utils::error::{FixMatchError, Result};

/// Hands out batches of indices from one rank's shard, forever
#[derive(Debug, Clone)]
pub struct ShardedSampler {
    indices: Vec<usize>,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    pass: u64,
    order: Vec<usize>,
    cursor: usize,
}

impl ShardedSampler {
    pub fn new(
        indices: Vec<usize>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(FixMatchError::Config(format!(
                "Invalid rank {} for world size {}",
                rank, world_size
            )));
        }
        if batch_size == 0 {
            return Err(FixMatchError::Config("Batch size must be positive".to_string()));
        }

        let mut sampler = Self {
            indices,
            batch_size,
            rank,
            world_size,
            shuffle,
            seed,
            pass: 0,
            order: Vec::new(),
            cursor: 0,
        };
        if sampler.shard_len() < batch_size {
            return Err(FixMatchError::Dataset(format!(
                "Shard of rank {} holds {} entries, fewer than one batch of {}",
                rank,
                sampler.shard_len(),
                batch_size
            )));
        }
        sampler.refill();
        Ok(sampler)
    }

    /// Entries this rank sees per pass
    pub fn shard_len(&self) -> usize {
        (self.indices.len() + self.world_size - 1 - self.rank) / self.world_size
    }

    /// Full batches per pass; the ragged tail is dropped
    pub fn batches_per_pass(&self) -> usize {
        self.shard_len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn refill(&mut self) {
        let mut order = self.indices.clone();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.pass));
            order.shuffle(&mut rng);
        }
        self.order = order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect();
        self.cursor = 0;
        self.pass += 1;
    }

    /// Next batch of dataset indices
    pub fn next_batch(&mut self) -> Vec<usize> {
        if self.cursor + self.batch_size > self.order.len() {
            self.refill();
        }
        let batch = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;
        batch
    }
}

/// Endless weakly augmented labeled batches
pub struct LabeledLoader<B: Backend> {
    dataset: Arc<ImageDataset>,
    sampler: ShardedSampler,
    augmenter: Augmenter,
    batcher: FixMatchBatcher,
    rng: ChaCha8Rng,
    device: B::Device,
}

impl<B: Backend> LabeledLoader<B> {
    pub fn new(
        dataset: Arc<ImageDataset>,
        sampler: ShardedSampler,
        augmenter: Augmenter,
        batcher: FixMatchBatcher,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            dataset,
            sampler,
            augmenter,
            batcher,
            rng: ChaCha8Rng::seed_from_u64(seed),
            device,
        }
    }

    pub fn batches_per_pass(&self) -> usize {
        self.sampler.batches_per_pass()
    }
}

impl<B: Backend> Iterator for LabeledLoader<B> {
    type Item = LabeledBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let items: Vec<ImageItem> = self
            .sampler
            .next_batch()
            .into_iter()
            .filter_map(|i| self.dataset.item(i))
            .map(|item| ImageItem {
                pixels: self.augmenter.weak(&item.pixels, &mut self.rng),
                label: item.label,
            })
            .collect();
        Some(self.batcher.batch(items, &self.device))
    }
}

/// Endless (weak, strong) unlabeled batches
pub struct UnlabeledLoader<B: Backend> {
    dataset: Arc<ImageDataset>,
    sampler: ShardedSampler,
    augmenter: Augmenter,
    batcher: FixMatchBatcher,
    rng: ChaCha8Rng,
    device: B::Device,
}

impl<B: Backend> UnlabeledLoader<B> {
    pub fn new(
        dataset: Arc<ImageDataset>,
        sampler: ShardedSampler,
        augmenter: Augmenter,
        batcher: FixMatchBatcher,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            dataset,
            sampler,
            augmenter,
            batcher,
            rng: ChaCha8Rng::seed_from_u64(seed),
            device,
        }
    }

    pub fn batches_per_pass(&self) -> usize {
        self.sampler.batches_per_pass()
    }
}

impl<B: Backend> Iterator for UnlabeledLoader<B> {
    type Item = UnlabeledBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let items: Vec<UnlabeledItem> = self
            .sampler
            .next_batch()
            .into_iter()
            .filter_map(|i| self.dataset.item(i))
            .map(|item| UnlabeledItem {
                weak: self.augmenter.weak(&item.pixels, &mut self.rng),
                strong: self.augmenter.strong(&item.pixels, &mut self.rng),
            })
            .collect();
        Some(self.batcher.batch(items, &self.device))
    }
}

/// One sequential, unaugmented pass over a dataset
pub struct TestLoader<B: Backend> {
    dataset: Arc<ImageDataset>,
    batch_size: usize,
    batcher: FixMatchBatcher,
    device: B::Device,
}

impl<B: Backend> TestLoader<B> {
    pub fn new(dataset: Arc<ImageDataset>, batch_size: usize, batcher: FixMatchBatcher, device: B::Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            batcher,
            device,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Batches in dataset order; the last one may be short
    pub fn iter(&self) -> impl Iterator<Item = LabeledBatch<B>> + '_ {
        (0..self.dataset.len())
            .step_by(self.batch_size)
            .map(move |start| {
                let end = (start + self.batch_size).min(self.dataset.len());
                let items: Vec<ImageItem> = (start..end)
                    .filter_map(|i| self.dataset.get(i))
                    .collect();
                self.batcher.batch(items, &self.device)
            })
    }
}
