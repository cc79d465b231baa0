//! Backend abstraction - Multi-backend support
//!
//! NdArray (CPU) by default; the `cuda` feature switches to CUDA.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (opt-in) or NdArray (default)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device for a process, indexed by its local rank when distributed
pub fn device_for_rank(local_rank: i64) -> <DefaultBackend as Backend>::Device {
    #[cfg(feature = "cuda")]
    {
        let index = if local_rank < 0 { 0 } else { local_rank as usize };
        burn::backend::cuda::CudaDevice::new(index)
    }

    #[cfg(not(feature = "cuda"))]
    {
        let _ = local_rank;
        <DefaultBackend as Backend>::Device::default()
    }
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}
