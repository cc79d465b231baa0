//! CIFAR binary readers
//!
//! CIFAR-10 records are `[label][3072 pixel bytes]`, CIFAR-100 records are
//! `[coarse label][fine label][3072 pixel bytes]`. Pixel bytes are stored
//! channel-planar (1024 red, 1024 green, 1024 blue), which is already the
//! `[channels, height, width]` layout the loaders use.

use std::fs;
use std::path::Path;

use tracing::debug;

use super::{ImageDataset, ImageItem, ImageShape};
use crate::utils::error::{FixMatchError, Result};

/// 32x32 RGB
pub const CIFAR_SHAPE: ImageShape = ImageShape {
    channels: 3,
    height: 32,
    width: 32,
};

const PIXELS: usize = 3 * 32 * 32;

/// Load CIFAR-10 from `root` (or `root/cifar-10-batches-bin`)
pub fn load_cifar10(root: &Path) -> Result<(ImageDataset, ImageDataset)> {
    let dir = resolve_dir(root, "cifar-10-batches-bin");

    let mut train = Vec::new();
    for i in 1..=5 {
        train.extend(read_records(&dir.join(format!("data_batch_{}.bin", i)), 1, 0)?);
    }
    let test = read_records(&dir.join("test_batch.bin"), 1, 0)?;

    Ok((
        ImageDataset::new(train, CIFAR_SHAPE, 10)?,
        ImageDataset::new(test, CIFAR_SHAPE, 10)?,
    ))
}

/// Load CIFAR-100 (fine labels) from `root` (or `root/cifar-100-binary`)
pub fn load_cifar100(root: &Path) -> Result<(ImageDataset, ImageDataset)> {
    let dir = resolve_dir(root, "cifar-100-binary");

    let train = read_records(&dir.join("train.bin"), 2, 1)?;
    let test = read_records(&dir.join("test.bin"), 2, 1)?;

    Ok((
        ImageDataset::new(train, CIFAR_SHAPE, 100)?,
        ImageDataset::new(test, CIFAR_SHAPE, 100)?,
    ))
}

fn resolve_dir(root: &Path, extracted_name: &str) -> std::path::PathBuf {
    let nested = root.join(extracted_name);
    if nested.is_dir() {
        nested
    } else {
        root.to_path_buf()
    }
}

/// Parse a file of fixed-size records with `label_bytes` leading label bytes,
/// taking the label at `label_offset`.
fn read_records(path: &Path, label_bytes: usize, label_offset: usize) -> Result<Vec<ImageItem>> {
    if !path.exists() {
        return Err(FixMatchError::PathNotFound(path.to_path_buf()));
    }
    let buffer = fs::read(path)?;
    parse_records(&buffer, label_bytes, label_offset)
        .map_err(|e| FixMatchError::Dataset(format!("{}: {}", path.display(), e)))
        .inspect(|items| debug!("Read {} records from {}", items.len(), path.display()))
}

fn parse_records(buffer: &[u8], label_bytes: usize, label_offset: usize) -> std::result::Result<Vec<ImageItem>, String> {
    let record_size = label_bytes + PIXELS;
    if buffer.is_empty() || buffer.len() % record_size != 0 {
        return Err(format!(
            "size {} is not a multiple of the {}-byte record size",
            buffer.len(),
            record_size
        ));
    }

    Ok(buffer
        .chunks_exact(record_size)
        .map(|record| ImageItem {
            label: record[label_offset] as usize,
            pixels: record[label_bytes..]
                .iter()
                .map(|&b| b as f32 / 255.0)
                .collect(),
        })
        .collect())
}
