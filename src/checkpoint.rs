//! Run checkpoints
//!
//! One `bincode` record per epoch holds everything needed to resume:
//! weights, EMA weights, optimizer and schedule state, and the accuracy
//! record. `epoch` is the next epoch to run. Weights are stored under plain
//! names whether or not the run was replicated.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::StateDict;
use crate::training::{OptimizerState, ScheduleState, TrainerSnapshot};
use crate::utils::error::{FixMatchError, Result};

/// File written after every epoch
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Copy of the checkpoint with the best test accuracy so far
pub const BEST_FILE: &str = "model_best.bin";

/// Everything persisted between epochs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Next epoch to run
    pub epoch: usize,
    pub state_dict: StateDict,
    /// Absent when EMA is disabled
    pub ema_state_dict: Option<StateDict>,
    /// Test accuracy of the epoch just finished
    pub acc: f64,
    /// Best test accuracy of the run so far
    pub best_acc: f64,
    pub optimizer: OptimizerState,
    pub scheduler: ScheduleState,
}

impl RunState {
    pub fn from_snapshot(snapshot: TrainerSnapshot, epoch: usize, acc: f64, best_acc: f64) -> Self {
        Self {
            epoch,
            state_dict: snapshot.state_dict,
            ema_state_dict: snapshot.ema_state_dict,
            acc,
            best_acc,
            optimizer: snapshot.optimizer,
            scheduler: snapshot.scheduler,
        }
    }
}

/// Write `state` to `<dir>/checkpoint.bin`, and copy it to
/// `<dir>/model_best.bin` when `is_best`
pub fn save_checkpoint(state: &RunState, is_best: bool, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(CHECKPOINT_FILE);
    let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));

    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        bincode::serialize_into(&mut writer, state)?;
        writer.flush()?;
    }
    fs::rename(&tmp, &path)?;
    debug!("Saved checkpoint for epoch {} to {:?}", state.epoch, path);

    if is_best {
        let best = dir.join(BEST_FILE);
        fs::copy(&path, &best)?;
        info!("New best {:.2} saved to {:?}", state.best_acc, best);
    }
    Ok(path)
}

/// Read a checkpoint. A missing file is an error, never an empty state.
pub fn load_checkpoint(path: &Path) -> Result<RunState> {
    if !path.is_file() {
        return Err(FixMatchError::PathNotFound(path.to_path_buf()));
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let state: RunState = bincode::deserialize_from(reader)?;
    info!(
        "Loaded checkpoint {:?}: next epoch {}, best acc {:.2}",
        path, state.epoch, state.best_acc
    );
    Ok(state)
}
