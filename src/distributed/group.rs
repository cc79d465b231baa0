//! Process groups
//!
//! The collectives the training loop needs: a barrier, an elementwise mean
//! across ranks and a broadcast from rank 0. None of them time out; a rank
//! that never arrives blocks the others.

use std::fmt::Debug;
use std::sync::{Arc, Barrier, Mutex};

use crate::utils::error::{FixMatchError, Result};

/// Collective communication between the ranks of one run
pub trait ProcessGroup: Send + Sync + Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank has called `barrier`
    fn barrier(&self) -> Result<()>;

    /// Replace `values` on every rank with the elementwise mean over ranks.
    /// Every rank must pass the same length.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()>;

    /// Replace `values` on every rank with rank 0's
    fn broadcast_from_main(&self, values: &mut Vec<f32>) -> Result<()>;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

/// A world of one; every collective is a no-op
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn broadcast_from_main(&self, _values: &mut Vec<f32>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct LocalShared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// One rank of a group whose ranks are threads of the same process
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<LocalShared>,
}

impl LocalGroup {
    /// Handles for every rank of a new group
    pub fn new_group(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(LocalShared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<f32>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| FixMatchError::Distributed("A peer thread panicked".to_string()))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        self.slots()?[self.rank] = values.to_vec();
        self.barrier()?;

        {
            let slots = self.slots()?;
            if let Some(bad) = slots.iter().find(|s| s.len() != values.len()) {
                return Err(FixMatchError::Distributed(format!(
                    "all_reduce length mismatch: {} vs {}",
                    bad.len(),
                    values.len()
                )));
            }
            // Same summation order on every rank, so results agree bit for bit
            for (i, v) in values.iter_mut().enumerate() {
                let sum: f32 = slots.iter().map(|s| s[i]).sum();
                *v = sum / self.world_size as f32;
            }
        }

        // Nobody may overwrite a slot before everyone has read it
        self.barrier()
    }

    fn broadcast_from_main(&self, values: &mut Vec<f32>) -> Result<()> {
        if self.is_main() {
            self.slots()?[0] = values.clone();
        }
        self.barrier()?;
        if !self.is_main() {
            *values = self.slots()?[0].clone();
        }
        self.barrier()
    }
}

/// Run `f` once per rank on its own thread and collect the results in rank
/// order
pub fn launch_local<T, F>(world_size: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(LocalGroup) -> T + Sync,
{
    let groups = LocalGroup::new_group(world_size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let f = &f;
                scope.spawn(move || f(group))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .map_err(|_| FixMatchError::Distributed(format!("Rank {} panicked", rank)))
            })
            .collect()
    })
}
