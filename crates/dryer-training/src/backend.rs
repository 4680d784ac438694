//! Backend selection.
//!
//! CPU (`ndarray`) by default; the `cuda` feature switches to the GPU backend.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

/// Autodiff backend every model is trained on
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub type DefaultDevice = <DefaultBackend as Backend>::Device;

pub fn default_device() -> DefaultDevice {
    DefaultDevice::default()
}

/// Human-readable name for the compiled-in backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }
    #[cfg(not(feature = "cuda"))]
    {
        "ndarray (CPU)"
    }
}
