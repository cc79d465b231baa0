//! Distributed runtime
//!
//! This module provides:
//! - The [`ProcessGroup`] collectives (barrier, mean all-reduce, broadcast)
//! - In-process (`LocalGroup`) and TCP (`TcpGroup`) implementations
//! - Launch parameters read from the process environment
//! - The `rank_zero_first` construction-ordering utility
//! - The [`Replicated`] model wrapper that averages gradients in backward
//!
//! Only rank 0 touches the filesystem; every other rank only computes.

pub mod group;
pub mod launch;
pub mod replicated;
pub mod tcp;

// Re-export main types for convenience
pub use group::{launch_local, LocalGroup, ProcessGroup, SingleProcess};
pub use launch::{rank_zero_first, LaunchContext};
pub use replicated::Replicated;
pub use tcp::TcpGroup;
