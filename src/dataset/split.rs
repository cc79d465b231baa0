//! Labeled/unlabeled index split
//!
//! A fixed number of labeled images per class is drawn with a seeded RNG.
//! Every training image (labeled ones included) is unlabeled data. Both index
//! lists are then expanded to their per-epoch budgets: whole copies first,
//! topped up with random picks.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::utils::error::{FixMatchError, Result};

/// Split `labels` into expanded `(labeled, unlabeled)` index lists
pub fn labeled_unlabeled_split(
    labels: &[usize],
    num_classes: usize,
    num_labeled: usize,
    labeled_expand: usize,
    unlabeled_expand: usize,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>)> {
    if num_classes == 0 {
        return Err(FixMatchError::Dataset("Dataset has no classes".to_string()));
    }
    let per_class = num_labeled / num_classes;
    if per_class == 0 {
        return Err(FixMatchError::Config(format!(
            "num_labeled ({}) must be at least the number of classes ({})",
            num_labeled, num_classes
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(index);
    }

    let mut labeled = Vec::with_capacity(per_class * num_classes);
    let mut unlabeled = Vec::with_capacity(labels.len());
    for class in 0..num_classes {
        let indices = by_class.get(&class).cloned().unwrap_or_default();
        if indices.len() < per_class {
            return Err(FixMatchError::Dataset(format!(
                "Class {} has {} images, {} labeled requested",
                class,
                indices.len(),
                per_class
            )));
        }
        unlabeled.extend_from_slice(&indices);
        labeled.extend(indices.choose_multiple(&mut rng, per_class).copied());
    }

    debug!(
        "Split: {} labeled ({} per class), {} unlabeled",
        labeled.len(),
        per_class,
        unlabeled.len()
    );

    let labeled = expand_indices(&labeled, labeled_expand, &mut rng);
    let unlabeled = expand_indices(&unlabeled, unlabeled_expand, &mut rng);
    Ok((labeled, unlabeled))
}

/// Repeat `indices` whole as often as fits in `target`, then top up with
/// random picks. A `target` smaller than `indices` leaves them unchanged.
pub fn expand_indices(indices: &[usize], target: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    if indices.is_empty() || target <= indices.len() {
        return indices.to_vec();
    }

    let copies = target / indices.len();
    let mut out = Vec::with_capacity(target);
    for _ in 0..copies {
        out.extend_from_slice(indices);
    }
    while out.len() < target {
        out.push(indices[rng.gen_range(0..indices.len())]);
    }
    out
}
