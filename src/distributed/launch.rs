//! Launch parameters and construction ordering

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::group::{ProcessGroup, SingleProcess};
use super::tcp::{TcpGroup, DEFAULT_CONNECT_TIMEOUT};
use crate::utils::error::{FixMatchError, Result};

/// Where this process sits in the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    /// -1 for a single-process run, else the device index on this host
    pub local_rank: i64,
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl LaunchContext {
    pub fn single() -> Self {
        Self {
            local_rank: -1,
            rank: 0,
            world_size: 1,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
        }
    }

    /// Read `WORLD_SIZE`, `RANK`, `MASTER_ADDR` and `MASTER_PORT` unless
    /// `local_rank` is -1
    pub fn from_env(local_rank: i64) -> Result<Self> {
        Self::from_vars(local_rank, |key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(local_rank: i64, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if local_rank == -1 {
            return Ok(Self::single());
        }
        if local_rank < -1 {
            return Err(FixMatchError::Config(format!("Invalid local rank {}", local_rank)));
        }

        let parse = |key: &str, default: Option<usize>| -> Result<usize> {
            match var(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| FixMatchError::Config(format!("{}='{}' is not a number", key, v))),
                None => default.ok_or_else(|| FixMatchError::Config(format!("{} is not set", key))),
            }
        };

        let world_size = parse("WORLD_SIZE", None)?;
        let rank = parse("RANK", Some(local_rank as usize))?;
        let master_port = parse("MASTER_PORT", Some(29500))?;
        if world_size == 0 || rank >= world_size {
            return Err(FixMatchError::Config(format!(
                "RANK {} out of range for WORLD_SIZE {}",
                rank, world_size
            )));
        }
        let master_port = u16::try_from(master_port)
            .map_err(|_| FixMatchError::Config(format!("MASTER_PORT {} out of range", master_port)))?;

        Ok(Self {
            local_rank,
            rank,
            world_size,
            master_addr: var("MASTER_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            master_port,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    /// Open the process group for this context
    pub fn init_group(&self) -> Result<Arc<dyn ProcessGroup>> {
        self.init_group_with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn init_group_with_timeout(&self, timeout: Duration) -> Result<Arc<dyn ProcessGroup>> {
        if !self.is_distributed() {
            return Ok(Arc::new(SingleProcess));
        }
        let addr = format!("{}:{}", self.master_addr, self.master_port);
        let group = TcpGroup::connect(self.rank, self.world_size, &addr, timeout)?;
        info!(
            "Process rank: {}, world size: {}, local rank: {}",
            self.rank, self.world_size, self.local_rank
        );
        Ok(Arc::new(group))
    }
}

/// Run `f` on rank 0 first, then on the other ranks, then wait for all.
///
/// Non-main ranks hold at the first barrier until rank 0 has finished `f`;
/// everyone then meets at a second barrier so rank 0 cannot run ahead while
/// others are still inside `f`.
pub fn rank_zero_first<T, F>(group: &dyn ProcessGroup, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    if !group.is_main() {
        group.barrier()?;
    }
    let out = f();
    if group.is_main() {
        group.barrier()?;
    }
    group.barrier()?;
    out
}
